//! Records exchanged with socket owners through their receive and send
//! buffers.
//!
//! Both record kinds start with an 8 byte little endian header. Receive
//! records carry the payload right after the header and the writer always
//! terminates the valid data with a zeroed header. Send records carry a
//! complete UDP packet after the header, the UDP header itself is filled in
//! by the stack.

use std::ops::Range;

use byteorder::{
    ByteOrder,
    LittleEndian,
};

use crate::core::repr::{
    Ipv4Address,
    UdpPacket,
};
use crate::{
    Error,
    Result,
};

pub const HEADER_LEN: usize = 8;

const ADDR: Range<usize> = 0 .. 4;

const PORT: Range<usize> = 4 .. 6;

const LENGTH: Range<usize> = 6 .. 8;

/// A datagram delivered into a receive buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceivedRecord<'a> {
    pub src_addr: Ipv4Address,
    pub src_port: u16,
    pub payload: &'a [u8],
}

impl<'a> ReceivedRecord<'a> {
    /// Returns the number of bytes a record with payload_len bytes occupies.
    pub fn buffer_len(payload_len: usize) -> usize {
        HEADER_LEN + payload_len
    }

    /// Parses the record at the start of buffer. Returns None when the buffer
    /// starts with the terminating zero length header.
    pub fn parse(buffer: &'a [u8]) -> Result<Option<ReceivedRecord<'a>>> {
        if buffer.len() < HEADER_LEN {
            return Err(Error::Exhausted);
        }

        let payload_len = LittleEndian::read_u16(&buffer[LENGTH]) as usize;
        if payload_len == 0 {
            return Ok(None);
        }

        if buffer.len() < Self::buffer_len(payload_len) {
            return Err(Error::Malformed);
        }

        Ok(Some(ReceivedRecord {
            src_addr: Ipv4Address::from(LittleEndian::read_u32(&buffer[ADDR])),
            src_port: LittleEndian::read_u16(&buffer[PORT]),
            payload: &buffer[HEADER_LEN .. HEADER_LEN + payload_len],
        }))
    }

    /// Writes a record header for payload_len bytes of payload.
    pub fn emit_header(
        buffer: &mut [u8],
        src_addr: Ipv4Address,
        src_port: u16,
        payload_len: u16,
    ) {
        LittleEndian::write_u32(&mut buffer[ADDR], u32::from(src_addr));
        LittleEndian::write_u16(&mut buffer[PORT], src_port);
        LittleEndian::write_u16(&mut buffer[LENGTH], payload_len);
    }
}

/// Iterates over the records of a receive buffer up to the terminating header.
pub struct ReceivedRecords<'a> {
    buffer: &'a [u8],
}

impl<'a> ReceivedRecords<'a> {
    pub fn new(buffer: &'a [u8]) -> ReceivedRecords<'a> {
        ReceivedRecords { buffer }
    }
}

impl<'a> Iterator for ReceivedRecords<'a> {
    type Item = ReceivedRecord<'a>;

    fn next(&mut self) -> Option<ReceivedRecord<'a>> {
        match ReceivedRecord::parse(self.buffer) {
            Ok(Some(record)) => {
                self.buffer = &self.buffer[ReceivedRecord::buffer_len(record.payload.len()) ..];
                Some(record)
            }
            _ => None,
        }
    }
}

/// Header of a record queued in a send buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendRecordHeader {
    pub dst_addr: Ipv4Address,
    pub dst_port: u16,
    /// UDP header plus payload.
    pub udp_len: u16,
}

impl SendRecordHeader {
    pub fn parse(buffer: &[u8]) -> Result<SendRecordHeader> {
        if buffer.len() < HEADER_LEN {
            return Err(Error::Exhausted);
        }

        Ok(SendRecordHeader {
            dst_addr: Ipv4Address::from(LittleEndian::read_u32(&buffer[ADDR])),
            dst_port: LittleEndian::read_u16(&buffer[PORT]),
            udp_len: LittleEndian::read_u16(&buffer[LENGTH]),
        })
    }

    pub fn emit(&self, buffer: &mut [u8]) {
        LittleEndian::write_u32(&mut buffer[ADDR], u32::from(self.dst_addr));
        LittleEndian::write_u16(&mut buffer[PORT], self.dst_port);
        LittleEndian::write_u16(&mut buffer[LENGTH], self.udp_len);
    }

    /// Number of bytes the whole record occupies in a send buffer.
    pub fn record_len(&self) -> usize {
        HEADER_LEN + self.udp_len as usize
    }

    /// Writes a complete record for payload and returns its length. The UDP
    /// header slot is zeroed.
    pub fn write_record(
        buffer: &mut [u8],
        dst_addr: Ipv4Address,
        dst_port: u16,
        payload: &[u8],
    ) -> Result<usize> {
        let udp_len = UdpPacket::<&[u8]>::buffer_len(payload.len());
        if udp_len > u16::max_value() as usize {
            return Err(Error::Malformed);
        }

        let header = SendRecordHeader {
            dst_addr,
            dst_port,
            udp_len: udp_len as u16,
        };
        if buffer.len() < header.record_len() {
            return Err(Error::Exhausted);
        }

        header.emit(buffer);
        let udp = &mut buffer[HEADER_LEN .. header.record_len()];
        for byte in udp[.. UdpPacket::<&[u8]>::HEADER_LEN].iter_mut() {
            *byte = 0;
        }
        udp[UdpPacket::<&[u8]>::HEADER_LEN ..].copy_from_slice(payload);

        Ok(header.record_len())
    }
}
