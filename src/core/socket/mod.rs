//! UDP sockets of the tasks running on the host.
//!
//! The `socket` module maps bound ports to per task socket slots, copies
//! received datagrams into the owners' receive buffers and queues their send
//! buffers for the network task.

mod manager;
mod requests;

pub use self::manager::{
    DoneFlag,
    SharedBuffer,
    SocketDesc,
    SocketManager,
    MAX_NUM_SOCKETS_PER_TASK,
    MAX_NUM_TRANSMISSION_REQUESTS,
    NUM_POSSIBLE_TASKS,
    NUM_UDP_PORTS,
};
pub use self::requests::{
    OutgoingUdpPacket,
    TransmissionRequestsIterator,
};
