use std::ops::Range;

use crate::core::repr::record::HEADER_LEN as RECORD_HEADER_LEN;
use crate::core::repr::{
    Ipv4Address,
    SendRecordHeader,
};
use crate::core::socket::manager::{
    SharedBuffer,
    SocketManager,
    Window,
};
use crate::core::storage::Index;

const UDP_HEADER_LEN: usize = 8;

/// The next UDP packet of a send buffer.
///
/// data spans the UDP header and payload inside buffer. The stack fills in
/// the UDP header before the first fragment goes out. busy marks a send
/// buffer its owner holds a borrow of, it is skipped until released.
#[derive(Clone, Debug, Default)]
pub struct OutgoingUdpPacket {
    pub busy: bool,
    pub src_port: u16,
    pub dst_port: u16,
    pub dst_addr: Ipv4Address,
    pub buffer: Option<SharedBuffer>,
    pub data: Range<usize>,
    pub identification: u16,
    pub fragment_offset: usize,
}

impl OutgoingUdpPacket {
    /// Length of UDP header plus payload, 0 when there is nothing to send.
    pub fn data_len(&self) -> usize {
        match self.buffer {
            Some(_) => self.data.len(),
            None => 0,
        }
    }
}

/// Cursor over the queued send buffers.
///
/// The manager is borrowed for the lifetime of the iterator, removing or
/// requeueing the current request moves the cursor to its successor.
pub struct TransmissionRequestsIterator<'a> {
    manager: &'a mut SocketManager,
    current: Option<Index>,
}

impl<'a> TransmissionRequestsIterator<'a> {
    pub(super) fn new(manager: &'a mut SocketManager) -> TransmissionRequestsIterator<'a> {
        let current = manager.pending.head();
        TransmissionRequestsIterator { manager, current }
    }

    pub fn is_finished(&self) -> bool {
        self.current.is_none()
    }

    pub fn go_to_next(&mut self) {
        if let Some(current) = self.current {
            self.current = self.manager.requests.next(current);
        }
    }

    fn port(&self) -> Option<u16> {
        self.current.map(|current| self.manager.requests.get(current).port)
    }

    fn send_window(&self) -> Option<&Window> {
        let port = self.port()?;
        self.manager.bound_socket(port)?.send.as_ref()
    }

    /// Returns the packet at the start of the current send buffer, or an
    /// empty packet if the socket was closed or the buffer holds no complete
    /// record. The packet is empty and busy while the owner borrows the
    /// buffer.
    pub fn top(&self) -> OutgoingUdpPacket {
        let (port, desc) = match self.port().and_then(|port| {
            self.manager.bound_socket(port).map(|desc| (port, desc))
        }) {
            Some(socket) => socket,
            None => return OutgoingUdpPacket::default(),
        };

        let window = match desc.send {
            Some(ref window) if window.len >= RECORD_HEADER_LEN + UDP_HEADER_LEN => window,
            _ => return OutgoingUdpPacket::default(),
        };

        if window.buffer.try_borrow_mut().is_err() {
            return OutgoingUdpPacket {
                busy: true,
                ..OutgoingUdpPacket::default()
            };
        }

        let header = match record_header(window) {
            Some(header) => header,
            None => return OutgoingUdpPacket::default(),
        };

        let udp_len = header.udp_len as usize;
        if udp_len < UDP_HEADER_LEN || window.len < header.record_len() {
            return OutgoingUdpPacket::default();
        }

        let start = window.offset + RECORD_HEADER_LEN;
        OutgoingUdpPacket {
            busy: false,
            src_port: port,
            dst_port: header.dst_port,
            dst_addr: header.dst_addr,
            buffer: Some(window.buffer.clone()),
            data: start .. start + udp_len,
            identification: desc.identification,
            fragment_offset: desc.fragment_offset,
        }
    }

    /// Stores the fragmentation progress of the current packet.
    pub fn update_top(&mut self, fragment_offset: usize, identification: u16) {
        if self.send_window().map_or(true, |window| window.len == 0) {
            return;
        }

        let port = match self.port() {
            Some(port) => port,
            None => return,
        };
        if let Some(desc) = self.manager.bound_socket_mut(port) {
            desc.fragment_offset = fragment_offset;
            desc.identification = identification;
        }
    }

    /// Moves past the sent packet at the start of the current send buffer.
    /// Returns true when no further packet can follow it.
    pub fn remove_top(&mut self) -> bool {
        let port = match self.port() {
            Some(port) => port,
            None => return true,
        };
        let desc = match self.manager.bound_socket_mut(port) {
            Some(desc) => desc,
            None => return true,
        };
        let window = match desc.send {
            Some(ref mut window) if window.len >= 2 * (RECORD_HEADER_LEN + UDP_HEADER_LEN) => window,
            _ => return true,
        };

        let header = match record_header(window) {
            Some(header) => header,
            None => return true,
        };
        let udp_len = header.udp_len as usize;
        if udp_len < UDP_HEADER_LEN
            || window.len < 2 * RECORD_HEADER_LEN + UDP_HEADER_LEN + udp_len
        {
            return true;
        }

        window.advance(header.record_len());
        desc.identification = 0;
        desc.fragment_offset = 0;
        false
    }

    /// Raises the done flag of the current send buffer.
    pub fn indicate_as_finished(&mut self) {
        let desc = match self.port().and_then(|port| self.manager.bound_socket(port)) {
            Some(desc) => desc,
            None => return,
        };

        if let Some(ref done) = desc.done {
            done.set(true);
        }
    }

    /// Drops the current request and moves to its successor.
    pub fn remove(&mut self) {
        if let Some(current) = self.current {
            let manager = &mut *self.manager;
            self.current = manager.requests.unlink(&mut manager.pending, current);
            manager.requests.release(current);
        }
    }

    /// Moves the current request to the end of the queue and continues with
    /// its successor. The last request stays current.
    pub fn relocate_to_end(&mut self) {
        let current = match self.current {
            Some(current) => current,
            None => return,
        };

        let manager = &mut *self.manager;
        if manager.requests.next(current).is_none() {
            return;
        }

        self.current = manager.requests.unlink(&mut manager.pending, current);
        manager.requests.push_back(&mut manager.pending, current);
    }
}

fn record_header(window: &Window) -> Option<SendRecordHeader> {
    let buffer = window.buffer.try_borrow().ok()?;
    let header = buffer.get(window.offset .. window.offset + RECORD_HEADER_LEN)?;
    let header = SendRecordHeader::parse(header).ok()?;
    if buffer.len() < window.offset + header.record_len() {
        return None;
    }
    Some(header)
}
