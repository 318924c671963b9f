//! Per interface protocol handling: frame classification, reassembly of
//! incoming datagrams, ARP and fragmentation of outgoing datagrams.
//!
//! A handler splits into a ReceiveHalf, run from the card's receive and timer
//! interrupts, and a TaskHalf, run by the network task. The halves share the
//! clock and meet in two queues: complete datagrams flow from the receive
//! half to the task half and ARP answers follow the same way.

use std::sync::Arc;

use crate::config::{
    InterfaceConfig,
    Timeouts,
};
use crate::core::arp_table::{
    ArpEntry,
    ArpTable,
};
use crate::core::reassembly::{
    reassembly_queues,
    Datagram,
    Fragment,
    PoolUsage,
    ReadyQueue,
    Reassembler,
    SLOT_CAPACITY,
};
use crate::core::repr::{
    arp_proto_types,
    eth_types,
    Arp,
    ArpOp,
    ArpPacket,
    EthernetAddress,
    EthernetFrame,
    Ipv4Address,
    Ipv4Packet,
};
use crate::core::storage::Handoff;
use crate::core::time::{
    Clock,
    Instant,
};
use crate::{
    Error,
    Result,
};

const ETHERNET_HEADER_LEN: usize = 14;

const ETHERNET_MTU: usize = 1500;

const IPV4_HEADER_LEN: usize = 20;

/// Largest IPv4 payload sent in a single frame, a multiple of 8.
pub const MAX_FRAGMENT_LEN: usize = ETHERNET_MTU - IPV4_HEADER_LEN;

/// Largest datagram payload the 16 bit total length field can describe.
pub const MAX_IPV4_PAYLOAD_LEN: usize = 65535 - IPV4_HEADER_LEN;

/// Length of an ARP request or reply frame.
pub const ARP_FRAME_LEN: usize = ETHERNET_HEADER_LEN + 28;

const IPV4_TTL: u8 = 255;

/// ARP answers received but not yet applied to the table.
const ARP_ANSWER_QUEUE_LEN: usize = 16;

/// Classification of an incoming frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    NotForThisMachine,
    ArpReply,
    /// An ARP request for our address, answer it with handle_outgoing_arp_reply(...).
    ArpRequest,
    Ipv4Packet,
    UnknownType,
}

/// Outcome of one handle_outgoing_ipv4_packet(...) call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ipv4PacketProgress {
    /// The next hop is not resolved yet, an ARP request may have been written.
    WaitingOnArpReply,
    /// Every ARP entry the next hop could use is taken.
    ArpTableFull,
    /// More fragments are left. The frame length is 0 if the write buffer
    /// was too small for the next one.
    SendingFragment,
    /// The last fragment was written or nothing was left to send.
    Done,
    /// The data does not fit in a single datagram, nothing will be sent.
    Rejected,
}

/// Resumable fragmentation state of an outgoing datagram.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FragmentProgress {
    pub identification: u16,
    /// Bytes of the datagram sent so far.
    pub fragment_offset: usize,
}

#[derive(Clone, Copy, Debug)]
struct ArpAnswer {
    ip: Ipv4Address,
    mac: EthernetAddress,
    at: Instant,
}

/// Protocol state of a single network interface.
///
/// SLOTS fragments can be buffered for reassembly and the ARP table has
/// BUCKETS buckets of BUCKET_LEN entries. All storage is allocated when the
/// handler is created.
///
/// Used whole, the handler serves a caller that runs both sides in one
/// context. into_halves() separates the interrupt side from the task side.
#[derive(Debug)]
pub struct NetworkStackHandler<const SLOTS: usize, const BUCKETS: usize, const BUCKET_LEN: usize> {
    receive: ReceiveHalf,
    task: TaskHalf,
}

/// Handler dimensions used for a physical network card.
pub type PhysicalStackHandler = NetworkStackHandler<1000, 10, 5>;

/// Handler dimensions used for the loopback interface.
pub type LoopbackStackHandler = NetworkStackHandler<100, 1, 1>;

impl<const SLOTS: usize, const BUCKETS: usize, const BUCKET_LEN: usize>
    NetworkStackHandler<SLOTS, BUCKETS, BUCKET_LEN>
{
    pub fn new(config: InterfaceConfig) -> Self {
        Self::with_timeouts(config, Timeouts::default())
    }

    pub fn with_timeouts(config: InterfaceConfig, timeouts: Timeouts) -> Self {
        let clock = Arc::new(Clock::new());
        let answers = Arc::new(Handoff::new(ARP_ANSWER_QUEUE_LEN));
        let (reassembler, ready) = reassembly_queues(SLOTS);

        NetworkStackHandler {
            receive: ReceiveHalf {
                config,
                fragment_timeout: timeouts.fragment,
                clock: clock.clone(),
                reassembler,
                answers: answers.clone(),
            },
            task: TaskHalf {
                config,
                timeouts,
                clock,
                ready,
                arp_table: ArpTable::new(BUCKETS, BUCKET_LEN),
                answers,
                next_identification: 0,
            },
        }
    }

    /// Separates the interrupt side from the task side.
    pub fn into_halves(self) -> (ReceiveHalf, TaskHalf) {
        (self.receive, self.task)
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.task.config
    }

    /// Advances the handler's clock by one tick.
    pub fn increment_timer_counter(&self) {
        self.receive.increment_timer_counter();
    }

    /// Returns the ticks passed since then.
    pub fn passed_time_since(&self, then: Instant) -> u32 {
        self.task.passed_time_since(then)
    }

    pub fn now(&self) -> Instant {
        self.task.now()
    }

    /// See ReceiveHalf::handle_incoming_ethernet_packet(...).
    pub fn handle_incoming_ethernet_packet(&mut self, frame: &[u8]) -> PacketType {
        self.receive.handle_incoming_ethernet_packet(frame)
    }

    pub fn handle_outgoing_arp_reply(&self, request: &[u8], write_buffer: &mut [u8]) -> usize {
        self.receive.handle_outgoing_arp_reply(request, write_buffer)
    }

    pub fn latest_ipv4_packet(&mut self) -> Option<Datagram> {
        self.task.latest_ipv4_packet()
    }

    pub fn pop_latest_ipv4_packet(&mut self) {
        self.task.pop_latest_ipv4_packet()
    }

    /// Usage of the reassembly slots across both halves.
    pub fn pool_usage(&self) -> PoolUsage {
        let ready = self.task.ready_usage();
        PoolUsage {
            ready_datagrams: ready.ready_datagrams,
            ready_slots: ready.ready_slots,
            ..self.receive.pool_usage()
        }
    }

    pub fn arp_entry(&mut self, ip: Ipv4Address) -> Option<ArpEntry> {
        self.task.arp_entry(ip)
    }

    pub fn handle_outgoing_ethernet_packet(
        &self,
        dst_addr: EthernetAddress,
        data: &[u8],
        write_buffer: &mut [u8],
    ) -> usize {
        self.task.handle_outgoing_ethernet_packet(dst_addr, data, write_buffer)
    }

    /// See TaskHalf::handle_outgoing_ipv4_packet(...).
    pub fn handle_outgoing_ipv4_packet(
        &mut self,
        dst_addr: Ipv4Address,
        protocol: u8,
        data: &[u8],
        progress: &mut FragmentProgress,
        write_buffer: &mut [u8],
    ) -> (Ipv4PacketProgress, usize) {
        self.task
            .handle_outgoing_ipv4_packet(dst_addr, protocol, data, progress, write_buffer)
    }
}

/// The part of a handler run from interrupt context: frame intake and the
/// timer.
#[derive(Debug)]
pub struct ReceiveHalf {
    config: InterfaceConfig,
    fragment_timeout: u32,
    clock: Arc<Clock>,
    reassembler: Reassembler,
    answers: Arc<Handoff<ArpAnswer>>,
}

impl ReceiveHalf {
    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    /// Advances the handler's clock by one tick.
    pub fn increment_timer_counter(&self) {
        self.clock.tick();
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Unused and incomplete reassembly slots.
    pub fn pool_usage(&self) -> PoolUsage {
        self.reassembler.usage()
    }

    /// Classifies a received frame. ARP replies are queued for the ARP table
    /// and IPv4 packets for this host go to reassembly.
    pub fn handle_incoming_ethernet_packet(&mut self, frame: &[u8]) -> PacketType {
        let frame = match EthernetFrame::try_new(frame) {
            Ok(frame) => frame,
            Err(_) => {
                debug!("Ignoring ethernet frame of {} bytes.", frame.len());
                return PacketType::NotForThisMachine;
            }
        };

        let dst_addr = frame.dst_addr();
        if dst_addr != self.config.mac && !dst_addr.is_broadcast() {
            debug!("Ignoring ethernet frame with destination {}.", dst_addr);
            return PacketType::NotForThisMachine;
        }

        match frame.payload_type() {
            eth_types::ARP => self.handle_incoming_arp(frame.payload()),
            eth_types::IPV4 => self.handle_incoming_ipv4(frame.payload()),
            payload_type => {
                debug!("Ignoring ethernet frame with type 0x{:04X}.", payload_type);
                PacketType::UnknownType
            }
        }
    }

    fn handle_incoming_arp(&mut self, payload: &[u8]) -> PacketType {
        let arp = match ArpPacket::try_new(payload) {
            Ok(arp) => arp,
            Err(_) => return PacketType::UnknownType,
        };

        if arp.proto_type() != arp_proto_types::IPV4 {
            return PacketType::UnknownType;
        }

        match arp.op() {
            op if op == ArpOp::Reply as u16 => {
                let answer = ArpAnswer {
                    ip: arp.source_proto_addr(),
                    mac: arp.source_hw_addr(),
                    at: self.clock.now(),
                };
                if self.answers.push(answer).is_err() {
                    debug!("Dropping ARP reply from {}, too many pending.", answer.ip);
                }
                PacketType::ArpReply
            }
            op if op == ArpOp::Request as u16 => {
                if arp.target_proto_addr() != self.config.ipv4_addr {
                    debug!("Ignoring ARP request for {}.", arp.target_proto_addr());
                    return PacketType::NotForThisMachine;
                }
                PacketType::ArpRequest
            }
            _ => PacketType::UnknownType,
        }
    }

    fn handle_incoming_ipv4(&mut self, payload: &[u8]) -> PacketType {
        let packet = match Ipv4Packet::try_new(payload) {
            Ok(packet) => packet,
            Err(_) => return PacketType::UnknownType,
        };

        if packet.ip_version() != 4 || (packet.header_len() as usize) < IPV4_HEADER_LEN {
            return PacketType::UnknownType;
        }

        let dst_addr = packet.dst_addr();
        if dst_addr != self.config.ipv4_addr && !dst_addr.is_broadcast() {
            debug!("Ignoring IPv4 packet with destination {}.", dst_addr);
            return PacketType::NotForThisMachine;
        }

        if let Err(err) = packet.check_encoding() {
            debug!("Ignoring IPv4 packet from {}: {:?}.", packet.src_addr(), err);
            return PacketType::UnknownType;
        }

        let payload = packet.payload();
        if payload.len() > SLOT_CAPACITY {
            debug!("Ignoring IPv4 packet with {} bytes of payload.", payload.len());
            return PacketType::UnknownType;
        }

        let fragment = Fragment {
            src_addr: packet.src_addr(),
            dst_addr,
            protocol: packet.protocol(),
            identification: packet.identification(),
            more_fragments: packet.more_fragments(),
            fragment_offset: packet.fragment_offset(),
            data_len: payload.len(),
        };

        match self.reassembler.insert(fragment, payload, &self.clock, self.fragment_timeout) {
            Ok(()) => PacketType::Ipv4Packet,
            Err(Error::Exhausted) => {
                warn!(
                    "Dropping IPv4 packet from {}, no free reassembly slot.",
                    fragment.src_addr
                );
                PacketType::Ipv4Packet
            }
            Err(err) => {
                debug!(
                    "Dropping IPv4 fragment {}@{} from {}: {:?}.",
                    fragment.identification, fragment.fragment_offset, fragment.src_addr, err
                );
                PacketType::Ipv4Packet
            }
        }
    }

    /// Writes the reply to an ARP request classified as PacketType::ArpRequest.
    /// Returns the frame length, or 0 if nothing was written.
    pub fn handle_outgoing_arp_reply(&self, request: &[u8], write_buffer: &mut [u8]) -> usize {
        let (requester_mac, requester_ip) = match requester_of(request) {
            Ok(requester) => requester,
            Err(_) => return 0,
        };

        let arp = Arp {
            op: ArpOp::Reply,
            source_hw_addr: self.config.mac,
            source_proto_addr: self.config.ipv4_addr,
            target_hw_addr: requester_mac,
            target_proto_addr: requester_ip,
        };

        debug!("Sending ARP reply to {}/{}.", requester_ip, requester_mac);
        emit_or_zero(emit_arp(&self.config, &arp, requester_mac, write_buffer))
    }
}

/// The part of a handler run by the network task: reading received
/// datagrams, the ARP table and sending.
#[derive(Debug)]
pub struct TaskHalf {
    config: InterfaceConfig,
    timeouts: Timeouts,
    clock: Arc<Clock>,
    ready: ReadyQueue,
    arp_table: ArpTable,
    answers: Arc<Handoff<ArpAnswer>>,
    next_identification: u16,
}

impl TaskHalf {
    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    /// Returns the ticks passed since then.
    pub fn passed_time_since(&self, then: Instant) -> u32 {
        self.clock.elapsed(then)
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Returns the oldest completely received datagram.
    pub fn latest_ipv4_packet(&mut self) -> Option<Datagram> {
        self.ready.latest()
    }

    /// Drops the datagram returned by latest_ipv4_packet(), freeing its slots.
    pub fn pop_latest_ipv4_packet(&mut self) {
        self.ready.pop_latest();
    }

    /// Ready reassembly slots and datagrams.
    pub fn ready_usage(&self) -> PoolUsage {
        self.ready.usage()
    }

    fn apply_arp_answers(&mut self) {
        while let Some(answer) = self.answers.pop() {
            if self.arp_table.update_from_reply(answer.ip, answer.mac, answer.at) {
                debug!("Received ARP reply, {} is at {}.", answer.ip, answer.mac);
            } else {
                debug!("Ignoring unsolicited ARP reply from {}.", answer.ip);
            }
        }
    }

    /// Returns a copy of the ARP table entry for ip.
    pub fn arp_entry(&mut self, ip: Ipv4Address) -> Option<ArpEntry> {
        self.apply_arp_answers();
        self.arp_table.entry(ip).cloned()
    }

    /// Writes data as the payload of a raw Ethernet frame, the type field
    /// holds the payload length. Returns the frame length, or 0 if data does
    /// not fit in a frame.
    pub fn handle_outgoing_ethernet_packet(
        &self,
        dst_addr: EthernetAddress,
        data: &[u8],
        write_buffer: &mut [u8],
    ) -> usize {
        if data.len() > ETHERNET_MTU {
            return 0;
        }

        let frame_len = EthernetFrame::<&[u8]>::buffer_len(data.len());
        if write_buffer.len() < frame_len {
            return 0;
        }

        let res = EthernetFrame::try_new(&mut write_buffer[.. frame_len]).map(|mut frame| {
            frame.set_dst_addr(dst_addr);
            frame.set_src_addr(self.config.mac);
            frame.set_payload_type(data.len() as u16);
            frame.payload_mut().copy_from_slice(data);
            frame_len
        });
        emit_or_zero(res)
    }

    /// Makes progress sending data to dst_addr as an IPv4 datagram.
    ///
    /// Each call writes at most one frame to write_buffer: an ARP request for
    /// the next hop or the next fragment of the datagram. Call it again with
    /// the same progress until it returns Done. Returns the progress and the
    /// length of the written frame, 0 if none was written.
    pub fn handle_outgoing_ipv4_packet(
        &mut self,
        dst_addr: Ipv4Address,
        protocol: u8,
        data: &[u8],
        progress: &mut FragmentProgress,
        write_buffer: &mut [u8],
    ) -> (Ipv4PacketProgress, usize) {
        if data.len() > MAX_IPV4_PAYLOAD_LEN {
            trace!(
                "Rejecting {} bytes to {}, more than fits in a datagram.",
                data.len(),
                dst_addr
            );
            return (Ipv4PacketProgress::Rejected, 0);
        }

        if progress.fragment_offset >= data.len() {
            return (Ipv4PacketProgress::Done, 0);
        }

        let remaining = data.len() - progress.fragment_offset;
        let last_fragment = remaining <= MAX_FRAGMENT_LEN;
        let fragment_len = if last_fragment { remaining } else { MAX_FRAGMENT_LEN };
        let frame_len = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + fragment_len;

        if write_buffer.len() < frame_len.max(ARP_FRAME_LEN) {
            warn!("Write buffer of {} bytes is too small.", write_buffer.len());
            return (Ipv4PacketProgress::SendingFragment, 0);
        }

        self.apply_arp_answers();

        let next_hop = if dst_addr.in_subnet(self.config.ipv4_addr, self.config.netmask_len) {
            dst_addr
        } else {
            self.config.gateway
        };

        let now = self.clock.now();
        let timeouts = self.timeouts;
        let clock = &*self.clock;
        let entry = match self.arp_table.select(next_hop, clock, timeouts.unused_arp_entry) {
            Some(entry) => entry,
            None => {
                debug!("No free ARP entry for {}.", next_hop);
                return (Ipv4PacketProgress::ArpTableFull, 0);
            }
        };

        let since_request = match entry.last_requested {
            Some(last_requested) => clock.elapsed(last_requested),
            None => {
                entry.last_requested = Some(now);
                return (
                    Ipv4PacketProgress::WaitingOnArpReply,
                    emit_or_zero(emit_arp_request(&self.config, next_hop, write_buffer)),
                );
            }
        };

        let answered = entry
            .last_answered
            .map(|last_answered| clock.elapsed(last_answered))
            .filter(|since_answer| *since_answer <= since_request);

        match answered {
            Some(since_answer) if since_answer > timeouts.arp_entry => {
                entry.last_requested = Some(now);
                return (
                    Ipv4PacketProgress::WaitingOnArpReply,
                    emit_or_zero(emit_arp_request(&self.config, next_hop, write_buffer)),
                );
            }
            Some(_) => (),
            None if since_request > timeouts.arp_broadcast_on_failure => {
                entry.last_requested = Some(now);
                return (
                    Ipv4PacketProgress::WaitingOnArpReply,
                    emit_or_zero(emit_arp_request(&self.config, next_hop, write_buffer)),
                );
            }
            None if since_request > timeouts.arp_request => {
                debug!("No ARP reply from {}, falling back to broadcast.", next_hop);
                entry.mac = EthernetAddress::BROADCAST;
            }
            None => return (Ipv4PacketProgress::WaitingOnArpReply, 0),
        }

        entry.last_used = Some(now);
        let dst_mac = entry.mac;

        if progress.fragment_offset == 0 {
            progress.identification = self.next_identification;
            self.next_identification = self.next_identification.wrapping_add(1);
        }

        let res = self.emit_fragment(
            dst_mac,
            dst_addr,
            protocol,
            &data[progress.fragment_offset .. progress.fragment_offset + fragment_len],
            !last_fragment,
            *progress,
            &mut write_buffer[.. frame_len],
        );
        progress.fragment_offset += fragment_len;

        let state = if last_fragment {
            Ipv4PacketProgress::Done
        } else {
            Ipv4PacketProgress::SendingFragment
        };
        (state, emit_or_zero(res))
    }

    fn emit_fragment(
        &self,
        dst_mac: EthernetAddress,
        dst_addr: Ipv4Address,
        protocol: u8,
        payload: &[u8],
        more_fragments: bool,
        progress: FragmentProgress,
        buffer: &mut [u8],
    ) -> Result<usize> {
        let frame_len = buffer.len();
        let mut frame = EthernetFrame::try_new(buffer)?;
        frame.set_dst_addr(dst_mac);
        frame.set_src_addr(self.config.mac);
        frame.set_payload_type(eth_types::IPV4);

        let mut packet = Ipv4Packet::try_new(frame.payload_mut())?;
        packet.set_version_and_header_len(IPV4_HEADER_LEN as u8);
        packet.set_type_of_service(0);
        packet.set_packet_len((IPV4_HEADER_LEN + payload.len()) as u16);
        packet.set_identification(progress.identification);
        packet.set_fragment(more_fragments, progress.fragment_offset);
        packet.set_ttl(IPV4_TTL);
        packet.set_protocol(protocol);
        // Filled in by the card.
        packet.set_header_checksum(0);
        packet.set_src_addr(self.config.ipv4_addr);
        packet.set_dst_addr(dst_addr);
        packet.payload_mut().copy_from_slice(payload);

        Ok(frame_len)
    }
}

fn emit_or_zero(res: Result<usize>) -> usize {
    match res {
        Ok(len) => len,
        Err(err) => {
            warn!("Failed to write frame: {:?}.", err);
            0
        }
    }
}

fn requester_of(request: &[u8]) -> Result<(EthernetAddress, Ipv4Address)> {
    let frame = EthernetFrame::try_new(request)?;
    let arp = ArpPacket::try_new(frame.payload())?;
    Ok((arp.source_hw_addr(), arp.source_proto_addr()))
}

fn emit_arp_request(config: &InterfaceConfig, target: Ipv4Address, buffer: &mut [u8]) -> Result<usize> {
    debug!("Sending ARP request for {}.", target);

    let arp = Arp {
        op: ArpOp::Request,
        source_hw_addr: config.mac,
        source_proto_addr: config.ipv4_addr,
        target_hw_addr: EthernetAddress::default(),
        target_proto_addr: target,
    };
    emit_arp(config, &arp, EthernetAddress::BROADCAST, buffer)
}

fn emit_arp(
    config: &InterfaceConfig,
    arp: &Arp,
    dst_addr: EthernetAddress,
    buffer: &mut [u8],
) -> Result<usize> {
    if buffer.len() < ARP_FRAME_LEN {
        return Err(Error::Exhausted);
    }

    let mut frame = EthernetFrame::try_new(&mut buffer[.. ARP_FRAME_LEN])?;
    frame.set_dst_addr(dst_addr);
    frame.set_src_addr(config.mac);
    frame.set_payload_type(eth_types::ARP);
    arp.serialize(frame.payload_mut())?;
    Ok(ARP_FRAME_LEN)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    const OUR_MAC: EthernetAddress = EthernetAddress::new([0x02, 0, 0, 0, 0, 0x01]);

    const PEER_MAC: EthernetAddress = EthernetAddress::new([0x02, 0, 0, 0, 0, 0x02]);

    const OUR_IP: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);

    const PEER_IP: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);

    const GATEWAY_IP: Ipv4Address = Ipv4Address::new([10, 0, 0, 254]);

    type Handler = PhysicalStackHandler;

    fn handler() -> Handler {
        Handler::new(InterfaceConfig::new(OUR_MAC, OUR_IP, GATEWAY_IP, 24))
    }

    fn peer() -> Handler {
        Handler::new(InterfaceConfig::new(PEER_MAC, PEER_IP, GATEWAY_IP, 24))
    }

    fn arp_frame(
        op: ArpOp,
        dst: EthernetAddress,
        src: EthernetAddress,
        src_ip: Ipv4Address,
        target_ip: Ipv4Address,
    ) -> Vec<u8> {
        let mut buffer = vec![0; ARP_FRAME_LEN];
        let arp = Arp {
            op,
            source_hw_addr: src,
            source_proto_addr: src_ip,
            target_hw_addr: if op == ArpOp::Reply { dst } else { EthernetAddress::default() },
            target_proto_addr: target_ip,
        };
        let config = InterfaceConfig::new(src, src_ip, GATEWAY_IP, 24);
        emit_arp(&config, &arp, dst, &mut buffer).unwrap();
        buffer
    }

    fn ipv4_frame(dst_ip: Ipv4Address, payload: &[u8]) -> Vec<u8> {
        ipv4_datagram(dst_ip, 7, IPV4_HEADER_LEN, payload)
    }

    fn ipv4_datagram(dst_ip: Ipv4Address, id: u16, header_len: usize, payload: &[u8]) -> Vec<u8> {
        let mut buffer = vec![0; ETHERNET_HEADER_LEN + header_len + payload.len()];
        {
            let mut frame = EthernetFrame::try_new(&mut buffer[..]).unwrap();
            frame.set_dst_addr(OUR_MAC);
            frame.set_src_addr(PEER_MAC);
            frame.set_payload_type(eth_types::IPV4);
            let mut packet = Ipv4Packet::try_new(frame.payload_mut()).unwrap();
            packet.set_version_and_header_len(header_len as u8);
            packet.set_packet_len((header_len + payload.len()) as u16);
            packet.set_identification(id);
            packet.set_fragment(false, 0);
            packet.set_ttl(64);
            packet.set_protocol(17);
            packet.set_src_addr(PEER_IP);
            packet.set_dst_addr(dst_ip);
            packet.payload_mut().copy_from_slice(payload);
        }
        buffer
    }

    /// Sends until the next hop is requested, answers it as PEER_MAC.
    fn resolve(handler: &mut Handler, dst: Ipv4Address, answer_ip: Ipv4Address) {
        let mut buffer = [0; 1514];
        let mut progress = FragmentProgress::default();
        assert_eq!(
            handler.handle_outgoing_ipv4_packet(dst, 17, &[0; 10], &mut progress, &mut buffer),
            (Ipv4PacketProgress::WaitingOnArpReply, ARP_FRAME_LEN)
        );
        let reply = arp_frame(ArpOp::Reply, OUR_MAC, PEER_MAC, answer_ip, OUR_IP);
        assert_eq!(handler.handle_incoming_ethernet_packet(&reply), PacketType::ArpReply);
    }

    #[test]
    fn test_classify_short_frame() {
        let mut handler = handler();
        assert_eq!(
            handler.handle_incoming_ethernet_packet(&[0xFF; 13]),
            PacketType::NotForThisMachine
        );
    }

    #[test]
    fn test_classify_other_destination() {
        let mut handler = handler();
        let mut frame = ipv4_frame(OUR_IP, &[1, 2, 3]);
        frame[.. 6].copy_from_slice(PEER_MAC.as_bytes());
        assert_eq!(handler.handle_incoming_ethernet_packet(&frame), PacketType::NotForThisMachine);
        assert!(handler.latest_ipv4_packet().is_none());
    }

    #[test]
    fn test_classify_unknown_type() {
        let mut handler = handler();
        let mut frame = ipv4_frame(OUR_IP, &[1, 2, 3]);
        frame[12] = 0x86;
        frame[13] = 0xDD;
        assert_eq!(handler.handle_incoming_ethernet_packet(&frame), PacketType::UnknownType);
    }

    #[test]
    fn test_classify_arp_request() {
        let mut handler = handler();

        let request = arp_frame(ArpOp::Request, EthernetAddress::BROADCAST, PEER_MAC, PEER_IP, OUR_IP);
        assert_eq!(handler.handle_incoming_ethernet_packet(&request), PacketType::ArpRequest);

        let request = arp_frame(ArpOp::Request, EthernetAddress::BROADCAST, PEER_MAC, PEER_IP, GATEWAY_IP);
        assert_eq!(handler.handle_incoming_ethernet_packet(&request), PacketType::NotForThisMachine);

        let mut request = arp_frame(ArpOp::Request, EthernetAddress::BROADCAST, PEER_MAC, PEER_IP, OUR_IP);
        request[20] = 0;
        request[21] = 3;
        assert_eq!(handler.handle_incoming_ethernet_packet(&request), PacketType::UnknownType);

        assert_eq!(handler.handle_incoming_ethernet_packet(&request[.. 41]), PacketType::UnknownType);
    }

    #[test]
    fn test_unsolicited_arp_reply_is_not_cached() {
        let mut handler = handler();
        let reply = arp_frame(ArpOp::Reply, OUR_MAC, PEER_MAC, PEER_IP, OUR_IP);
        assert_eq!(handler.handle_incoming_ethernet_packet(&reply), PacketType::ArpReply);
        assert!(handler.arp_entry(PEER_IP).is_none());
    }

    #[test]
    fn test_arp_reply() {
        let handler = handler();
        let request = arp_frame(ArpOp::Request, EthernetAddress::BROADCAST, PEER_MAC, PEER_IP, OUR_IP);
        let mut buffer = [0; 64];

        assert_eq!(handler.handle_outgoing_arp_reply(&request, &mut buffer), ARP_FRAME_LEN);
        assert_eq!(&buffer[.. ARP_FRAME_LEN], &arp_frame(ArpOp::Reply, PEER_MAC, OUR_MAC, OUR_IP, PEER_IP)[..]);

        assert_eq!(handler.handle_outgoing_arp_reply(&request, &mut buffer[.. 41]), 0);
        assert_eq!(handler.handle_outgoing_arp_reply(&request[.. 30], &mut buffer), 0);
    }

    #[test]
    fn test_incoming_ipv4_packet() {
        let mut handler = handler();
        let frame = ipv4_frame(OUR_IP, b"hello");
        assert_eq!(handler.handle_incoming_ethernet_packet(&frame), PacketType::Ipv4Packet);

        {
            let datagram = handler.latest_ipv4_packet().unwrap();
            assert_eq!(datagram.src_addr(), PEER_IP);
            assert_eq!(datagram.protocol(), 17);
            assert_eq!(datagram.len(), 5);
            let (_, payload) = datagram.fragments().next().unwrap();
            assert_eq!(payload, b"hello");
        }

        handler.pop_latest_ipv4_packet();
        assert!(handler.latest_ipv4_packet().is_none());
        assert_eq!(handler.pool_usage().unused_slots, 1000);
    }

    #[test]
    fn test_incoming_ipv4_packet_with_options() {
        let mut handler = handler();
        let frame = ipv4_datagram(OUR_IP, 9, IPV4_HEADER_LEN + 4, b"hello");
        assert_eq!(handler.handle_incoming_ethernet_packet(&frame), PacketType::Ipv4Packet);

        let datagram = handler.latest_ipv4_packet().unwrap();
        assert_eq!(datagram.header().identification, 9);
        assert_eq!(datagram.len(), 5);
        let (_, payload) = datagram.fragments().next().unwrap();
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_incoming_ipv4_packet_rejections() {
        let mut handler = handler();

        let frame = ipv4_frame(GATEWAY_IP, b"hello");
        assert_eq!(handler.handle_incoming_ethernet_packet(&frame), PacketType::NotForThisMachine);

        let frame = ipv4_frame(Ipv4Address::BROADCAST, b"hello");
        assert_eq!(handler.handle_incoming_ethernet_packet(&frame), PacketType::Ipv4Packet);
        handler.pop_latest_ipv4_packet();

        let mut frame = ipv4_frame(OUR_IP, b"hello");
        frame[14] = 0x65;
        assert_eq!(handler.handle_incoming_ethernet_packet(&frame), PacketType::UnknownType);

        let frame = ipv4_frame(OUR_IP, b"hello");
        assert_eq!(handler.handle_incoming_ethernet_packet(&frame[.. frame.len() - 1]), PacketType::UnknownType);

        let frame = ipv4_frame(OUR_IP, &[0; SLOT_CAPACITY + 1]);
        assert_eq!(handler.handle_incoming_ethernet_packet(&frame), PacketType::UnknownType);

        assert!(handler.latest_ipv4_packet().is_none());
    }

    #[test]
    fn test_outgoing_ethernet_packet() {
        let handler = handler();
        let mut buffer = [0; 1514];

        assert_eq!(handler.handle_outgoing_ethernet_packet(PEER_MAC, b"raw", &mut buffer), 17);
        let frame = EthernetFrame::try_new(&buffer[.. 17]).unwrap();
        assert_eq!(frame.dst_addr(), PEER_MAC);
        assert_eq!(frame.src_addr(), OUR_MAC);
        assert_eq!(frame.payload_type(), 3);
        assert_eq!(frame.payload(), b"raw");

        assert_eq!(handler.handle_outgoing_ethernet_packet(PEER_MAC, &[0; 1501], &mut buffer), 0);
        assert_eq!(handler.handle_outgoing_ethernet_packet(PEER_MAC, b"raw", &mut buffer[.. 16]), 0);
    }

    #[test]
    fn test_send_fragmented_datagram() {
        let mut handler = handler();
        let mut peer = peer();
        let data: Vec<u8> = (0 .. 21000).map(|i| (i % 251) as u8).collect();
        let mut progress = FragmentProgress::default();
        let mut buffer = [0; 1514];

        let (state, len) = handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &data, &mut progress, &mut buffer);
        assert_eq!((state, len), (Ipv4PacketProgress::WaitingOnArpReply, ARP_FRAME_LEN));
        assert_eq!(&buffer[.. 6], EthernetAddress::BROADCAST.as_bytes());
        assert_eq!(peer.handle_incoming_ethernet_packet(&buffer[.. len]), PacketType::ArpRequest);

        assert_eq!(
            handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &data, &mut progress, &mut buffer),
            (Ipv4PacketProgress::WaitingOnArpReply, 0)
        );

        let request = buffer[.. ARP_FRAME_LEN].to_vec();
        let len = peer.handle_outgoing_arp_reply(&request, &mut buffer);
        assert_eq!(handler.handle_incoming_ethernet_packet(&buffer[.. len]), PacketType::ArpReply);
        assert_eq!(handler.arp_entry(PEER_IP).map(|entry| entry.mac), Some(PEER_MAC));

        let mut fragments = 0;
        loop {
            let (state, len) = handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &data, &mut progress, &mut buffer);
            fragments += 1;
            assert!(len > 0);
            assert_eq!(&buffer[.. 6], PEER_MAC.as_bytes());
            assert_eq!(peer.handle_incoming_ethernet_packet(&buffer[.. len]), PacketType::Ipv4Packet);
            if state == Ipv4PacketProgress::Done {
                assert_eq!(len, 14 + 20 + 21000 - 14 * MAX_FRAGMENT_LEN);
                break;
            }
            assert_eq!(state, Ipv4PacketProgress::SendingFragment);
            assert_eq!(len, 1514);
        }
        assert_eq!(fragments, 15);
        assert_eq!(progress.fragment_offset, 21000);

        assert_eq!(
            handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &data, &mut progress, &mut buffer),
            (Ipv4PacketProgress::Done, 0)
        );

        let datagram = peer.latest_ipv4_packet().unwrap();
        assert_eq!(datagram.src_addr(), OUR_IP);
        assert_eq!(datagram.len(), 21000);
        let received: Vec<u8> = datagram
            .fragments()
            .flat_map(|(_, payload)| payload.iter().cloned())
            .collect();
        assert_eq!(received, data);
    }

    #[test]
    fn test_exact_fragment_size_is_last_fragment() {
        let mut handler = handler();
        resolve(&mut handler, PEER_IP, PEER_IP);

        let mut progress = FragmentProgress::default();
        let mut buffer = [0; 1514];
        let data = [0; MAX_FRAGMENT_LEN];
        assert_eq!(
            handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &data, &mut progress, &mut buffer),
            (Ipv4PacketProgress::Done, 1514)
        );
        let packet = Ipv4Packet::try_new(&buffer[14 ..]).unwrap();
        assert!(!packet.more_fragments());
    }

    #[test]
    fn test_largest_datagram() {
        let mut handler = handler();
        resolve(&mut handler, PEER_IP, PEER_IP);

        let mut progress = FragmentProgress::default();
        let mut buffer = [0; 1514];
        let data = vec![0; MAX_IPV4_PAYLOAD_LEN];
        let mut fragments = 0;
        loop {
            let (state, len) = handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &data, &mut progress, &mut buffer);
            fragments += 1;
            assert!(len > 0);
            if state != Ipv4PacketProgress::SendingFragment {
                assert_eq!(state, Ipv4PacketProgress::Done);
                break;
            }
        }

        assert_eq!(fragments, 45);
        assert_eq!(progress.fragment_offset, MAX_IPV4_PAYLOAD_LEN);
        let packet = Ipv4Packet::try_new(&buffer[14 ..]).unwrap();
        assert_eq!(packet.fragment_offset(), 65120);
        assert!(!packet.more_fragments());
    }

    #[test]
    fn test_oversized_datagram_is_rejected() {
        let mut handler = handler();
        let mut progress = FragmentProgress::default();
        let mut buffer = [0; 1514];
        let data = vec![0; MAX_IPV4_PAYLOAD_LEN + 1];

        assert_eq!(
            handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &data, &mut progress, &mut buffer),
            (Ipv4PacketProgress::Rejected, 0)
        );
        assert_eq!(progress, FragmentProgress::default());
        assert!(handler.arp_entry(PEER_IP).is_none());
    }

    #[test]
    fn test_identification_per_datagram() {
        let mut handler = handler();
        resolve(&mut handler, PEER_IP, PEER_IP);
        let mut buffer = [0; 1514];

        for id in 0 .. 3 {
            let mut progress = FragmentProgress::default();
            handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &[1; 3000], &mut progress, &mut buffer);
            assert_eq!(progress.identification, id);
            handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &[1; 3000], &mut progress, &mut buffer);
            let packet = Ipv4Packet::try_new(&buffer[14 ..]).unwrap();
            assert_eq!(packet.identification(), id);
            assert_eq!(packet.fragment_offset(), MAX_FRAGMENT_LEN);
        }
    }

    #[test]
    fn test_remote_destination_uses_gateway() {
        let mut handler = handler();
        let remote = Ipv4Address::new([192, 168, 1, 1]);
        let mut buffer = [0; 1514];
        let mut progress = FragmentProgress::default();

        handler.handle_outgoing_ipv4_packet(remote, 17, &[0; 10], &mut progress, &mut buffer);
        let arp = ArpPacket::try_new(&buffer[14 .. ARP_FRAME_LEN]).unwrap();
        assert_eq!(arp.target_proto_addr(), GATEWAY_IP);
        assert!(handler.arp_entry(GATEWAY_IP).is_some());

        let reply = arp_frame(ArpOp::Reply, OUR_MAC, PEER_MAC, GATEWAY_IP, OUR_IP);
        handler.handle_incoming_ethernet_packet(&reply);
        assert_eq!(
            handler.handle_outgoing_ipv4_packet(remote, 17, &[0; 10], &mut progress, &mut buffer),
            (Ipv4PacketProgress::Done, 44)
        );
        let packet = Ipv4Packet::try_new(&buffer[14 .. 44]).unwrap();
        assert_eq!(packet.dst_addr(), remote);
    }

    #[test]
    fn test_broadcast_fallback() {
        let mut handler = handler();
        let mut buffer = [0; 1514];
        let data = [0; 10];
        let send = |handler: &mut Handler, buffer: &mut [u8]| {
            let mut progress = FragmentProgress::default();
            handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &data, &mut progress, buffer)
        };

        assert_eq!(send(&mut handler, &mut buffer), (Ipv4PacketProgress::WaitingOnArpReply, ARP_FRAME_LEN));

        for _ in 0 .. 10 {
            handler.increment_timer_counter();
        }
        assert_eq!(send(&mut handler, &mut buffer), (Ipv4PacketProgress::WaitingOnArpReply, 0));

        for _ in 11 ..= 15 {
            handler.increment_timer_counter();
            assert_eq!(send(&mut handler, &mut buffer), (Ipv4PacketProgress::Done, 44));
            assert_eq!(&buffer[.. 6], EthernetAddress::BROADCAST.as_bytes());
        }

        handler.increment_timer_counter();
        assert_eq!(send(&mut handler, &mut buffer), (Ipv4PacketProgress::WaitingOnArpReply, ARP_FRAME_LEN));
        assert_eq!(send(&mut handler, &mut buffer), (Ipv4PacketProgress::WaitingOnArpReply, 0));
    }

    #[test]
    fn test_expired_arp_entry_is_requested_again() {
        let mut handler = handler();
        resolve(&mut handler, PEER_IP, PEER_IP);
        let mut buffer = [0; 1514];
        let data = [0; 10];

        for _ in 0 .. 120 {
            handler.increment_timer_counter();
        }
        let mut progress = FragmentProgress::default();
        assert_eq!(
            handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &data, &mut progress, &mut buffer),
            (Ipv4PacketProgress::Done, 44)
        );

        handler.increment_timer_counter();
        let mut progress = FragmentProgress::default();
        assert_eq!(
            handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &data, &mut progress, &mut buffer),
            (Ipv4PacketProgress::WaitingOnArpReply, ARP_FRAME_LEN)
        );
        assert_eq!(progress.fragment_offset, 0);
    }

    #[test]
    fn test_arp_table_full() {
        let mut handler = LoopbackStackHandler::new(InterfaceConfig::new(OUR_MAC, OUR_IP, GATEWAY_IP, 24));
        let mut buffer = [0; 1514];
        let mut progress = FragmentProgress::default();

        assert_eq!(
            handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &[0; 10], &mut progress, &mut buffer).0,
            Ipv4PacketProgress::WaitingOnArpReply
        );
        assert_eq!(
            handler.handle_outgoing_ipv4_packet(GATEWAY_IP, 17, &[0; 10], &mut progress, &mut buffer),
            (Ipv4PacketProgress::ArpTableFull, 0)
        );
    }

    #[test]
    fn test_small_write_buffer() {
        let mut handler = handler();
        let mut buffer = [0; 40];
        let mut progress = FragmentProgress::default();
        assert_eq!(
            handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &[0; 10], &mut progress, &mut buffer),
            (Ipv4PacketProgress::SendingFragment, 0)
        );
        assert_eq!(progress, FragmentProgress::default());
        assert!(handler.arp_entry(PEER_IP).is_none());

        // The same progress resumes once a large enough buffer is offered.
        let mut buffer = [0; 1514];
        assert_eq!(
            handler.handle_outgoing_ipv4_packet(PEER_IP, 17, &[0; 10], &mut progress, &mut buffer),
            (Ipv4PacketProgress::WaitingOnArpReply, ARP_FRAME_LEN)
        );
    }

    #[test]
    fn test_halves_in_separate_threads() {
        let handler = LoopbackStackHandler::new(InterfaceConfig::new(OUR_MAC, OUR_IP, GATEWAY_IP, 24));
        let (mut receive, mut task) = handler.into_halves();
        let mut buffer = [0; 1514];
        let mut progress = FragmentProgress::default();
        assert_eq!(
            task.handle_outgoing_ipv4_packet(PEER_IP, 17, &[0; 10], &mut progress, &mut buffer),
            (Ipv4PacketProgress::WaitingOnArpReply, ARP_FRAME_LEN)
        );

        // More datagrams than slots, the receiver waits for the task to free some.
        let receiver = thread::spawn(move || {
            let reply = arp_frame(ArpOp::Reply, OUR_MAC, PEER_MAC, PEER_IP, OUR_IP);
            assert_eq!(receive.handle_incoming_ethernet_packet(&reply), PacketType::ArpReply);

            for id in 0 .. 300u16 {
                while receive.pool_usage().unused_slots == 0 {
                    thread::yield_now();
                }
                if id % 10 == 0 {
                    receive.increment_timer_counter();
                }
                let frame = ipv4_datagram(OUR_IP, id, IPV4_HEADER_LEN, &id.to_be_bytes());
                assert_eq!(receive.handle_incoming_ethernet_packet(&frame), PacketType::Ipv4Packet);
            }
        });

        let mut received = Vec::new();
        while received.len() < 300 {
            let id = match task.latest_ipv4_packet() {
                Some(datagram) => {
                    assert_eq!(datagram.len(), 2);
                    datagram.header().identification
                }
                None => {
                    thread::yield_now();
                    continue;
                }
            };
            received.push(id);
            task.pop_latest_ipv4_packet();
        }
        receiver.join().unwrap();

        assert_eq!(received, (0 .. 300).collect::<Vec<u16>>());
        assert_eq!(task.ready_usage().ready_slots, 0);

        let mut progress = FragmentProgress::default();
        assert_eq!(
            task.handle_outgoing_ipv4_packet(PEER_IP, 17, &[0; 10], &mut progress, &mut buffer),
            (Ipv4PacketProgress::Done, 44)
        );
        assert_eq!(&buffer[.. 6], PEER_MAC.as_bytes());
    }
}
