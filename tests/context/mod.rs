#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use udpstack::core::dev::NetworkInterface;
use udpstack::core::repr::{
    eth_types,
    ipv4_protocols,
    Arp,
    ArpOp,
    EthernetAddress,
    EthernetFrame,
    Ipv4Address,
    Ipv4Packet,
    ReceivedRecords,
    SendRecordHeader,
    UdpPacket,
};
use udpstack::core::service::NetworkManagementTask;
use udpstack::core::socket::{
    SharedBuffer,
    SocketManager,
};

pub const HOST_MAC: EthernetAddress = EthernetAddress::new([0x02, 0, 0, 0, 0, 0x01]);

pub const HOST_IP: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);

pub const PEER_MAC: EthernetAddress = EthernetAddress::new([0x02, 0, 0, 0, 0, 0x02]);

pub const PEER_IP: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);

pub const GATEWAY_IP: Ipv4Address = Ipv4Address::new([10, 0, 0, 254]);

const MAX_FRAGMENT_LEN: usize = 1480;

lazy_static! {
    static ref LOGGER: () = {
        let _ = env_logger::try_init();
    };
}

/// Installs the logger once per test binary, RUST_LOG controls the output.
pub fn init_logger() {
    lazy_static::initialize(&LOGGER);
}

/// A transmitted frame.
#[derive(Clone, Debug)]
pub struct SentFrame {
    pub data: Vec<u8>,
    pub is_ipv4: bool,
}

/// A card whose transmitted frames are kept for inspection. At most capacity
/// frames can be in flight until take_sent() hands them out.
#[derive(Debug)]
pub struct WireInterface {
    mac: EthernetAddress,
    buffer: Vec<u8>,
    sent: Vec<SentFrame>,
    capacity: usize,
}

impl WireInterface {
    pub fn new(mac: EthernetAddress) -> WireInterface {
        WireInterface::with_capacity(mac, 64)
    }

    pub fn with_capacity(mac: EthernetAddress, capacity: usize) -> WireInterface {
        WireInterface {
            mac,
            buffer: vec![0; 1514],
            sent: vec![],
            capacity,
        }
    }

    pub fn take_sent(&mut self) -> Vec<SentFrame> {
        std::mem::replace(&mut self.sent, vec![])
    }

    pub fn in_flight(&self) -> usize {
        self.sent.len()
    }
}

impl NetworkInterface for WireInterface {
    fn mac(&self) -> EthernetAddress {
        self.mac
    }

    fn write_buffer(&mut self) -> Option<&mut [u8]> {
        if self.sent.len() < self.capacity {
            Some(&mut self.buffer[..])
        } else {
            None
        }
    }

    fn finish_write_buffer(&mut self, len: usize, is_ipv4: bool) {
        self.sent.push(SentFrame {
            data: self.buffer[.. len].to_vec(),
            is_ipv4,
        });
    }
}

pub type Host = NetworkManagementTask<WireInterface>;

pub fn host() -> Host {
    init_logger();
    Host::new(WireInterface::new(HOST_MAC), HOST_IP, GATEWAY_IP, 24)
}

pub fn peer() -> Host {
    init_logger();
    Host::new(WireInterface::new(PEER_MAC), PEER_IP, GATEWAY_IP, 24)
}

/// Polls both hosts and moves the frames between them until neither sends
/// anything.
pub fn exchange(a: &mut Host, a_sockets: &mut SocketManager, b: &mut Host, b_sockets: &mut SocketManager) {
    for _ in 0 .. 32 {
        a.poll(a_sockets);
        b.poll(b_sockets);

        let a_sent = a.physical_mut().take_sent();
        let b_sent = b.physical_mut().take_sent();
        if a_sent.is_empty() && b_sent.is_empty() {
            return;
        }

        for frame in a_sent {
            b.handle_physical_frame(&frame.data);
        }
        for frame in b_sent {
            a.handle_physical_frame(&frame.data);
        }
    }
}

pub fn shared(len: usize) -> SharedBuffer {
    Rc::new(RefCell::new(vec![0; len]))
}

/// A send buffer with one record per (destination, port, payload) and a
/// terminating header.
pub fn send_buffer(records: &[(Ipv4Address, u16, &[u8])]) -> SharedBuffer {
    let len = records.iter().map(|r| 16 + r.2.len()).sum::<usize>() + 8;
    let mut buffer = vec![0; len];
    let mut at = 0;
    for &(dst_addr, dst_port, payload) in records {
        at += SendRecordHeader::write_record(&mut buffer[at ..], dst_addr, dst_port, payload).unwrap();
    }
    Rc::new(RefCell::new(buffer))
}

/// The (source address, source port, payload) of every record in a receive
/// buffer.
pub fn received(buffer: &SharedBuffer) -> Vec<(Ipv4Address, u16, Vec<u8>)> {
    ReceivedRecords::new(&buffer.borrow())
        .map(|record| (record.src_addr, record.src_port, record.payload.to_vec()))
        .collect()
}

pub fn arp_request(src_mac: EthernetAddress, src_ip: Ipv4Address, target_ip: Ipv4Address) -> Vec<u8> {
    let arp = Arp {
        op: ArpOp::Request,
        source_hw_addr: src_mac,
        source_proto_addr: src_ip,
        target_hw_addr: EthernetAddress::default(),
        target_proto_addr: target_ip,
    };

    let mut buffer = vec![0; 42];
    {
        let mut frame = EthernetFrame::try_new(&mut buffer[..]).unwrap();
        frame.set_dst_addr(EthernetAddress::BROADCAST);
        frame.set_src_addr(src_mac);
        frame.set_payload_type(eth_types::ARP);
        arp.serialize(frame.payload_mut()).unwrap();
    }
    buffer
}

/// Frames carrying a UDP datagram from PEER to HOST, fragmented like the
/// stack does it.
pub fn udp_frames(src_port: u16, dst_port: u16, payload: &[u8], identification: u16) -> Vec<Vec<u8>> {
    let mut udp = vec![0; 8 + payload.len()];
    {
        let mut packet = UdpPacket::try_new(&mut udp[..]).unwrap();
        packet.set_src_port(src_port);
        packet.set_dst_port(dst_port);
        packet.set_length((8 + payload.len()) as u16);
        packet.payload_mut().copy_from_slice(payload);
    }

    udp.chunks(MAX_FRAGMENT_LEN)
        .enumerate()
        .map(|(i, chunk)| {
            let offset = i * MAX_FRAGMENT_LEN;
            let more_fragments = offset + chunk.len() < udp.len();

            let mut buffer = vec![0; 34 + chunk.len()];
            {
                let mut frame = EthernetFrame::try_new(&mut buffer[..]).unwrap();
                frame.set_dst_addr(HOST_MAC);
                frame.set_src_addr(PEER_MAC);
                frame.set_payload_type(eth_types::IPV4);

                let mut packet = Ipv4Packet::try_new(frame.payload_mut()).unwrap();
                packet.set_version_and_header_len(20);
                packet.set_packet_len((20 + chunk.len()) as u16);
                packet.set_identification(identification);
                packet.set_fragment(more_fragments, offset);
                packet.set_ttl(64);
                packet.set_protocol(ipv4_protocols::UDP);
                packet.set_src_addr(PEER_IP);
                packet.set_dst_addr(HOST_IP);
                packet.payload_mut().copy_from_slice(chunk);
                packet.fill_checksum().unwrap();
            }
            buffer
        })
        .collect()
}
