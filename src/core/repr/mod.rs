//! Serialization and deserialization of network packets.
//!
//! The `repr` module provides views over byte buffers for the frames and
//! packets handled at each layer, plus the record formats used to hand
//! datagrams to and from socket owners.

pub mod arp;
pub mod ethernet;
pub mod ipv4;
pub mod record;
pub mod udp;

pub use self::arp::{
    hw_types as arp_hw_types,
    proto_types as arp_proto_types,
    Arp,
    Op as ArpOp,
    Packet as ArpPacket,
};
pub use self::ethernet::{
    eth_types,
    Address as EthernetAddress,
    Frame as EthernetFrame,
};
pub use self::ipv4::{
    flags as ipv4_flags,
    protocols as ipv4_protocols,
    Address as Ipv4Address,
    Packet as Ipv4Packet,
};
pub use self::record::{
    ReceivedRecord,
    ReceivedRecords,
    SendRecordHeader,
};
pub use self::udp::Packet as UdpPacket;
