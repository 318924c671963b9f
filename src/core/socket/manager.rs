use std::cell::{
    Cell,
    RefCell,
};
use std::rc::Rc;

use crate::core::reassembly::Datagram;
use crate::core::repr::record::HEADER_LEN as RECORD_HEADER_LEN;
use crate::core::repr::{
    ipv4_protocols,
    ReceivedRecord,
    UdpPacket,
};
use crate::core::socket::TransmissionRequestsIterator;
use crate::core::storage::{
    List,
    Pool,
};
use crate::{
    Error,
    Result,
};

/// Sockets a single task can have open at once.
pub const MAX_NUM_SOCKETS_PER_TASK: usize = 10;

/// Ports 0 .. NUM_UDP_PORTS can be bound.
pub const NUM_UDP_PORTS: usize = 9000;

/// Send buffers that can be queued at once over all sockets.
pub const MAX_NUM_TRANSMISSION_REQUESTS: usize = 15;

/// Number of task ids the manager keeps socket tables for.
pub const NUM_POSSIBLE_TASKS: usize = 50;

const UDP_HEADER_LEN: usize = 8;

/// Memory shared between a socket owner and the manager.
pub type SharedBuffer = Rc<RefCell<Vec<u8>>>;

/// Set once every record of a send buffer was transmitted.
pub type DoneFlag = Rc<Cell<bool>>;

/// The unconsumed part of a socket buffer.
#[derive(Clone, Debug)]
pub(super) struct Window {
    pub buffer: SharedBuffer,
    pub offset: usize,
    /// Bytes left from offset on.
    pub len: usize,
}

impl Window {
    fn new(buffer: SharedBuffer, len: usize) -> Window {
        Window {
            buffer,
            offset: 0,
            len,
        }
    }

    pub fn advance(&mut self, len: usize) {
        self.offset += len;
        self.len -= len;
    }
}

/// State of one socket slot of a task.
#[derive(Clone, Debug, Default)]
pub struct SocketDesc {
    pub(super) active: bool,
    pub(super) port: u16,
    pub(super) receive: Option<Window>,
    pub(super) send: Option<Window>,
    pub(super) identification: u16,
    pub(super) fragment_offset: usize,
    pub(super) done: Option<DoneFlag>,
}

impl SocketDesc {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the unused bytes of the receive buffer.
    pub fn receive_capacity(&self) -> usize {
        self.receive.as_ref().map_or(0, |window| window.len)
    }

    /// Returns the bytes of the send buffer not transmitted yet.
    pub fn send_remaining(&self) -> usize {
        self.send.as_ref().map_or(0, |window| window.len)
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct PortState {
    active: bool,
    task: usize,
    socket: usize,
}

/// A queued send buffer, referring to its socket by port so a closed socket
/// is noticed on the next access.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct TransmissionRequest {
    pub port: u16,
}

/// UDP sockets of all tasks and the queue of their pending send buffers.
///
/// Owners hand in buffers instead of single datagrams. Received datagrams
/// are appended to the receive buffer as records, see `repr::record`, and
/// the send buffer holds a sequence of send records which are transmitted in
/// order.
#[derive(Debug)]
pub struct SocketManager {
    sockets: Vec<SocketDesc>,
    ports: Vec<PortState>,
    pub(super) requests: Pool<TransmissionRequest>,
    pub(super) pending: List,
}

impl SocketManager {
    pub fn new() -> SocketManager {
        SocketManager {
            sockets: vec![SocketDesc::default(); NUM_POSSIBLE_TASKS * MAX_NUM_SOCKETS_PER_TASK],
            ports: vec![PortState::default(); NUM_UDP_PORTS],
            requests: Pool::new(MAX_NUM_TRANSMISSION_REQUESTS, TransmissionRequest::default),
            pending: List::new(),
        }
    }

    fn index(task: usize, socket: usize) -> Option<usize> {
        if task < NUM_POSSIBLE_TASKS && socket < MAX_NUM_SOCKETS_PER_TASK {
            Some(task * MAX_NUM_SOCKETS_PER_TASK + socket)
        } else {
            None
        }
    }

    /// Returns the socket slot of a task.
    pub fn socket(&self, task: usize, socket: usize) -> Option<&SocketDesc> {
        Self::index(task, socket).map(|i| &self.sockets[i])
    }

    fn active_socket_mut(&mut self, task: usize, socket: usize) -> Result<&mut SocketDesc> {
        match Self::index(task, socket) {
            Some(i) if self.sockets[i].active => Ok(&mut self.sockets[i]),
            _ => Err(Error::NoOp),
        }
    }

    /// Returns the active socket bound to port.
    pub(super) fn bound_socket(&self, port: u16) -> Option<&SocketDesc> {
        let state = self.ports.get(port as usize)?;
        if state.active {
            Some(&self.sockets[state.task * MAX_NUM_SOCKETS_PER_TASK + state.socket])
        } else {
            None
        }
    }

    pub(super) fn bound_socket_mut(&mut self, port: u16) -> Option<&mut SocketDesc> {
        let state = *self.ports.get(port as usize)?;
        if state.active {
            Some(&mut self.sockets[state.task * MAX_NUM_SOCKETS_PER_TASK + state.socket])
        } else {
            None
        }
    }

    /// Binds port to a free socket slot of task and returns the slot.
    pub fn open_socket(&mut self, task: usize, port: u16) -> Result<usize> {
        if task >= NUM_POSSIBLE_TASKS || port as usize >= NUM_UDP_PORTS {
            return Err(Error::Address);
        }

        if self.ports[port as usize].active {
            return Err(Error::InUse);
        }

        let base = task * MAX_NUM_SOCKETS_PER_TASK;
        let socket = self.sockets[base .. base + MAX_NUM_SOCKETS_PER_TASK]
            .iter()
            .position(|desc| !desc.active)
            .ok_or(Error::Exhausted)?;

        self.sockets[base + socket] = SocketDesc {
            active: true,
            port,
            ..SocketDesc::default()
        };
        self.ports[port as usize] = PortState {
            active: true,
            task,
            socket,
        };

        debug!("Task {} bound UDP port {} to socket {}.", task, port, socket);
        Ok(socket)
    }

    /// Unbinds a socket. A queued send buffer is dropped the next time the
    /// transmission requests are polled.
    pub fn close_socket(&mut self, task: usize, socket: usize) {
        if let Ok(desc) = self.active_socket_mut(task, socket) {
            desc.active = false;
            let port = desc.port;
            self.ports[port as usize].active = false;
            debug!("Task {} closed UDP port {}.", task, port);
        }
    }

    pub fn close_all_sockets_for_task(&mut self, task: usize) {
        for socket in 0 .. MAX_NUM_SOCKETS_PER_TASK {
            self.close_socket(task, socket);
        }
    }

    /// Replaces the receive buffer of a socket. The buffer must at least hold
    /// a record header and the terminating header.
    pub fn set_receive_buffer(&mut self, task: usize, socket: usize, buffer: SharedBuffer) -> Result<()> {
        if socket >= MAX_NUM_SOCKETS_PER_TASK {
            return Err(Error::NoOp);
        }

        let len = buffer.try_borrow().map_err(|_| Error::Busy)?.len();
        if len < 2 * RECORD_HEADER_LEN {
            return Err(Error::Exhausted);
        }

        self.active_socket_mut(task, socket)?.receive = Some(Window::new(buffer, len));
        Ok(())
    }

    /// Replaces the send buffer of a socket and queues it for transmission
    /// ahead of all other pending buffers. done is set once every record in
    /// buffer was sent.
    pub fn set_send_buffer(
        &mut self,
        task: usize,
        socket: usize,
        buffer: SharedBuffer,
        done: Option<DoneFlag>,
    ) -> Result<()> {
        if socket >= MAX_NUM_SOCKETS_PER_TASK {
            return Err(Error::NoOp);
        }

        let len = buffer.try_borrow().map_err(|_| Error::Busy)?.len();
        if len < RECORD_HEADER_LEN + UDP_HEADER_LEN {
            return Err(Error::Exhausted);
        }

        self.active_socket_mut(task, socket)?;
        let request = self.requests.alloc()?;

        let desc = self.active_socket_mut(task, socket)?;
        desc.send = Some(Window::new(buffer, len));
        desc.identification = 0;
        desc.fragment_offset = 0;
        desc.done = done;
        let port = desc.port;

        self.requests.get_mut(request).port = port;
        self.requests.push_front(&mut self.pending, request);
        Ok(())
    }

    /// Appends a reassembled UDP datagram to the receive buffer of the socket
    /// bound to its destination port.
    ///
    /// Nothing is written unless the datagram is consistent and fits,
    /// Ignored means no socket wanted it. Busy means the owner holds a
    /// borrow of the receive buffer, the datagram can be offered again.
    pub fn handle_received_packet(&mut self, datagram: &Datagram) -> Result<()> {
        if datagram.protocol() != ipv4_protocols::UDP {
            return Err(Error::Ignored);
        }

        let (_, first) = datagram.fragments().next().ok_or(Error::Ignored)?;
        let udp = UdpPacket::try_new(first).map_err(|_| Error::Ignored)?;
        let (src_port, dst_port, udp_len) = (udp.src_port(), udp.dst_port(), udp.length() as usize);

        let window = match self.bound_socket_mut(dst_port) {
            Some(desc) => desc.receive.as_mut().ok_or(Error::Exhausted)?,
            None => return Err(Error::Ignored),
        };

        if udp_len < UDP_HEADER_LEN {
            return Err(Error::Malformed);
        }

        let payload_len = udp_len - UDP_HEADER_LEN;
        let record_len = ReceivedRecord::buffer_len(payload_len);
        if record_len + RECORD_HEADER_LEN > window.len {
            debug!("Receive buffer of UDP port {} is full.", dst_port);
            return Err(Error::Exhausted);
        }

        if datagram.len() != udp_len {
            debug!(
                "Dropping UDP datagram for port {}, length {} but {} bytes received.",
                dst_port,
                udp_len,
                datagram.len()
            );
            return Err(Error::Malformed);
        }

        {
            let mut buffer = match window.buffer.try_borrow_mut() {
                Ok(buffer) => buffer,
                Err(_) => {
                    debug!("Receive buffer of UDP port {} is borrowed, retrying later.", dst_port);
                    return Err(Error::Busy);
                }
            };
            let record = buffer
                .get_mut(window.offset .. window.offset + record_len + RECORD_HEADER_LEN)
                .ok_or(Error::Exhausted)?;

            ReceivedRecord::emit_header(record, datagram.src_addr(), src_port, payload_len as u16);
            let mut at = RECORD_HEADER_LEN;
            for (i, (_, data)) in datagram.fragments().enumerate() {
                let data = if i == 0 { &data[UDP_HEADER_LEN ..] } else { data };
                record[at .. at + data.len()].copy_from_slice(data);
                at += data.len();
            }
            for byte in record[at ..].iter_mut() {
                *byte = 0;
            }
        }

        window.advance(record_len);
        trace!(
            "Received {} bytes from {}:{} on UDP port {}.",
            payload_len,
            datagram.src_addr(),
            src_port,
            dst_port
        );
        Ok(())
    }

    /// Returns an iterator over the queued send buffers, most recently queued
    /// first.
    pub fn transmission_requests(&mut self) -> TransmissionRequestsIterator {
        TransmissionRequestsIterator::new(self)
    }

    /// Returns the number of queued send buffers.
    pub fn pending_transmission_requests(&self) -> usize {
        self.requests.iter(&self.pending).count()
    }
}

impl Default for SocketManager {
    fn default() -> SocketManager {
        SocketManager::new()
    }
}
