use crate::core::dev::NetworkInterface;
use crate::core::reassembly::SLOT_CAPACITY;
use crate::core::repr::{
    EthernetAddress,
    EthernetFrame,
    Ipv4Packet,
};
use crate::core::storage::Ring;
use crate::{
    Error,
    Result,
};

/// Number of frames the loopback can hold.
pub const NUM_LOOPBACK_BUFFERS: usize = 5;

#[derive(Debug)]
struct Descriptor {
    buffer: Box<[u8]>,
    len: usize,
}

/// An in memory network card, every transmitted frame is received again.
#[derive(Debug)]
pub struct LoopbackInterface {
    mac: EthernetAddress,
    descriptors: Ring<Descriptor>,
}

impl LoopbackInterface {
    pub fn new(mac: EthernetAddress) -> LoopbackInterface {
        let descriptors = (0 .. NUM_LOOPBACK_BUFFERS)
            .map(|_| Descriptor {
                buffer: vec![0; SLOT_CAPACITY].into_boxed_slice(),
                len: 0,
            })
            .collect::<Vec<_>>();

        LoopbackInterface {
            mac,
            descriptors: Ring::from(descriptors),
        }
    }

    /// Returns the oldest transmitted frame that was not received yet.
    pub fn read_buffer(&self) -> Option<&[u8]> {
        self.descriptors
            .head()
            .ok()
            .map(|descriptor| &descriptor.buffer[.. descriptor.len])
    }

    /// Releases the frame returned by read_buffer().
    pub fn finish_read_buffer(&mut self) {
        let _ = self.descriptors.dequeue_with(|_| ());
    }

    /// Returns the number of frames waiting to be received.
    pub fn pending(&self) -> usize {
        self.descriptors.len()
    }
}

/// Fills in the IPv4 header checksum of a frame, the job checksum offloading
/// does on a physical card.
fn fill_ipv4_checksum(frame: &mut [u8]) -> Result<()> {
    let mut frame = EthernetFrame::try_new(frame)?;
    let mut packet = Ipv4Packet::try_new(frame.payload_mut())?;
    packet.fill_checksum()
}

impl NetworkInterface for LoopbackInterface {
    fn mac(&self) -> EthernetAddress {
        self.mac
    }

    fn write_buffer(&mut self) -> Option<&mut [u8]> {
        self.descriptors
            .vacant_mut()
            .ok()
            .map(|descriptor| &mut descriptor.buffer[..])
    }

    fn finish_write_buffer(&mut self, len: usize, is_ipv4: bool) {
        let res = self.descriptors.enqueue_maybe(|descriptor| {
            if len < EthernetFrame::<&[u8]>::HEADER_LEN
                || len > EthernetFrame::<&[u8]>::MAX_FRAME_LEN
            {
                return Err(Error::Malformed);
            }

            if is_ipv4 {
                fill_ipv4_checksum(&mut descriptor.buffer[.. len])?;
            }

            descriptor.len = len;
            Ok(())
        });

        if let Err(err) = res {
            debug!("Dropping loopback frame of {} bytes: {:?}.", len, err);
        }
    }
}
