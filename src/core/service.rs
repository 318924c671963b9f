//! The network task: frame intake per interface, the timer and the loop that
//! moves data between sockets and interfaces.

use crate::config::{
    InterfaceConfig,
    Timeouts,
};
use crate::core::dev::NetworkInterface;
use crate::core::loopback::LoopbackInterface;
use crate::core::repr::{
    ipv4_protocols,
    EthernetAddress,
    Ipv4Address,
    UdpPacket,
};
use crate::core::socket::{
    OutgoingUdpPacket,
    SocketManager,
};
use crate::core::stack::{
    FragmentProgress,
    Ipv4PacketProgress,
    LoopbackStackHandler,
    NetworkStackHandler,
    PacketType,
    PhysicalStackHandler,
    ARP_FRAME_LEN,
};
use crate::Error;

/// Drives a physical interface P and the loopback interface of a host.
///
/// handle_physical_frame(...) and tick() stand in for the card's receive
/// interrupt and the timer interrupt. poll(...) is one iteration of the
/// network task. Callers with real interrupt handlers split each stack with
/// NetworkStackHandler::into_halves() instead.
pub struct NetworkManagementTask<P: NetworkInterface> {
    physical: P,
    physical_stack: PhysicalStackHandler,
    loopback: LoopbackInterface,
    loopback_stack: LoopbackStackHandler,
}

impl<P: NetworkInterface> NetworkManagementTask<P> {
    pub fn new(physical: P, ipv4_addr: Ipv4Address, gateway: Ipv4Address, netmask_len: u8) -> Self {
        Self::with_timeouts(physical, ipv4_addr, gateway, netmask_len, Timeouts::default())
    }

    pub fn with_timeouts(
        physical: P,
        ipv4_addr: Ipv4Address,
        gateway: Ipv4Address,
        netmask_len: u8,
        timeouts: Timeouts,
    ) -> Self {
        let config = InterfaceConfig::new(physical.mac(), ipv4_addr, gateway, netmask_len);
        let loopback_config = InterfaceConfig::loopback(ipv4_addr);

        NetworkManagementTask {
            physical,
            physical_stack: NetworkStackHandler::with_timeouts(config, timeouts),
            loopback: LoopbackInterface::new(loopback_config.mac),
            loopback_stack: NetworkStackHandler::with_timeouts(loopback_config, timeouts),
        }
    }

    pub fn ipv4_addr(&self) -> Ipv4Address {
        self.physical_stack.config().ipv4_addr
    }

    pub fn physical(&self) -> &P {
        &self.physical
    }

    pub fn physical_mut(&mut self) -> &mut P {
        &mut self.physical
    }

    pub fn physical_stack(&self) -> &PhysicalStackHandler {
        &self.physical_stack
    }

    pub fn physical_stack_mut(&mut self) -> &mut PhysicalStackHandler {
        &mut self.physical_stack
    }

    pub fn loopback_stack(&self) -> &LoopbackStackHandler {
        &self.loopback_stack
    }

    pub fn loopback_stack_mut(&mut self) -> &mut LoopbackStackHandler {
        &mut self.loopback_stack
    }

    /// Handles a frame received by the physical card. ARP requests for our
    /// address are answered right away.
    pub fn handle_physical_frame(&mut self, frame: &[u8]) -> PacketType {
        let packet_type = self.physical_stack.handle_incoming_ethernet_packet(frame);

        if packet_type == PacketType::ArpRequest {
            match self.physical.write_buffer() {
                Some(buffer) => {
                    let len = self.physical_stack.handle_outgoing_arp_reply(frame, buffer);
                    if len > 0 {
                        self.physical.finish_write_buffer(len, false);
                    }
                }
                None => debug!("No write buffer for ARP reply, dropping request."),
            }
        }

        packet_type
    }

    /// Receives every frame queued on the loopback interface.
    pub fn service_loopback(&mut self) {
        drain_loopback(&mut self.loopback_stack, &mut self.loopback);
    }

    /// Advances the clocks of both interfaces by one tick.
    pub fn tick(&self) {
        self.physical_stack.increment_timer_counter();
        self.loopback_stack.increment_timer_counter();
    }

    /// Sends a raw Ethernet frame over the physical card, returning the frame
    /// length or 0 if nothing was sent.
    pub fn send_ethernet_frame(&mut self, dst_addr: EthernetAddress, data: &[u8]) -> usize {
        let len = match self.physical.write_buffer() {
            Some(buffer) => self.physical_stack.handle_outgoing_ethernet_packet(dst_addr, data, buffer),
            None => 0,
        };
        if len > 0 {
            self.physical.finish_write_buffer(len, false);
        }
        len
    }

    /// Makes one pass over the queued send buffers and then delivers all
    /// reassembled datagrams to their sockets.
    ///
    /// Datagrams to our own address go over the loopback interface. A pass
    /// stops early once the chosen interface runs out of write buffers.
    /// Send buffers borrowed by their owner are skipped and records too
    /// large for a datagram are dropped.
    pub fn poll(&mut self, sockets: &mut SocketManager) {
        let ipv4_addr = self.ipv4_addr();
        let mut requests = sockets.transmission_requests();

        while !requests.is_finished() {
            let packet = requests.top();
            if packet.busy {
                debug!("Send buffer is borrowed by its owner, skipping it.");
                requests.go_to_next();
                continue;
            }

            let data_len = packet.data_len();

            if data_len == 0 {
                requests.indicate_as_finished();
                requests.remove();
                continue;
            }

            let mut progress = FragmentProgress {
                identification: packet.identification,
                fragment_offset: packet.fragment_offset,
            };

            let (state, has_write_buffer) = if packet.dst_addr == ipv4_addr {
                send_udp_packet(
                    &mut self.loopback_stack,
                    &mut self.loopback,
                    &packet,
                    &mut progress,
                    drain_loopback,
                )
            } else {
                send_udp_packet(
                    &mut self.physical_stack,
                    &mut self.physical,
                    &packet,
                    &mut progress,
                    |_: &mut PhysicalStackHandler, _: &mut P| (),
                )
            };

            let rejected = state == Some(Ipv4PacketProgress::Rejected);
            if rejected || progress.fragment_offset >= data_len {
                if rejected {
                    debug!(
                        "Dropping {} bytes from UDP port {}, too large for a datagram.",
                        data_len, packet.src_port
                    );
                } else {
                    trace!(
                        "Sent {} bytes from UDP port {} to {}:{}.",
                        data_len,
                        packet.src_port,
                        packet.dst_addr,
                        packet.dst_port
                    );
                }
                if requests.remove_top() {
                    requests.indicate_as_finished();
                    requests.remove();
                } else {
                    requests.relocate_to_end();
                }
            } else if !has_write_buffer {
                requests.update_top(progress.fragment_offset, progress.identification);
                break;
            } else {
                requests.update_top(progress.fragment_offset, progress.identification);
                requests.go_to_next();
            }
        }

        deliver(&mut self.physical_stack, sockets);
        deliver(&mut self.loopback_stack, sockets);
    }
}

/// Sends fragments of packet until it is done, blocked on ARP or the
/// interface has no write buffer left. after_frame runs after every
/// transmitted frame. Returns the last progress reported by the stack, None
/// if nothing was attempted, and whether a write buffer is still available.
fn send_udp_packet<I, F, const SLOTS: usize, const BUCKETS: usize, const BUCKET_LEN: usize>(
    stack: &mut NetworkStackHandler<SLOTS, BUCKETS, BUCKET_LEN>,
    interface: &mut I,
    packet: &OutgoingUdpPacket,
    progress: &mut FragmentProgress,
    mut after_frame: F,
) -> (Option<Ipv4PacketProgress>, bool)
where
    I: NetworkInterface,
    F: FnMut(&mut NetworkStackHandler<SLOTS, BUCKETS, BUCKET_LEN>, &mut I),
{
    let buffer = match packet.buffer {
        Some(ref buffer) => buffer,
        None => return (None, interface.write_buffer().is_some()),
    };
    let mut buffer = match buffer.try_borrow_mut() {
        Ok(buffer) => buffer,
        Err(_) => {
            debug!("Send buffer of UDP port {} is borrowed, retrying later.", packet.src_port);
            return (None, interface.write_buffer().is_some());
        }
    };
    let data = match buffer.get_mut(packet.data.clone()) {
        Some(data) => data,
        None => return (None, interface.write_buffer().is_some()),
    };

    loop {
        let write_buffer = match interface.write_buffer() {
            Some(write_buffer) => write_buffer,
            None => return (None, false),
        };

        if progress.fragment_offset == 0 {
            let data_len = data.len() as u16;
            if let Ok(mut udp) = UdpPacket::try_new(&mut *data) {
                udp.set_src_port(packet.src_port);
                udp.set_dst_port(packet.dst_port);
                udp.set_length(data_len);
                udp.set_checksum(0);
            }
        }

        let (state, len) = stack.handle_outgoing_ipv4_packet(
            packet.dst_addr,
            ipv4_protocols::UDP,
            data,
            progress,
            write_buffer,
        );

        if len > 0 {
            let is_ipv4 = state == Ipv4PacketProgress::Done || state == Ipv4PacketProgress::SendingFragment;
            interface.finish_write_buffer(len, is_ipv4);
            after_frame(stack, interface);
        }

        // A frame of length 0 means the write buffer was too small.
        if state != Ipv4PacketProgress::SendingFragment || len == 0 {
            return (Some(state), interface.write_buffer().is_some());
        }
    }
}

/// Receives the frames queued on the loopback interface, answering ARP
/// requests on the way.
fn drain_loopback(stack: &mut LoopbackStackHandler, loopback: &mut LoopbackInterface) {
    loop {
        let mut request = [0; ARP_FRAME_LEN];
        let packet_type = match loopback.read_buffer() {
            Some(frame) => {
                let packet_type = stack.handle_incoming_ethernet_packet(frame);
                if packet_type == PacketType::ArpRequest {
                    request.copy_from_slice(&frame[.. ARP_FRAME_LEN]);
                }
                packet_type
            }
            None => break,
        };
        loopback.finish_read_buffer();

        if packet_type == PacketType::ArpRequest {
            if let Some(buffer) = loopback.write_buffer() {
                let len = stack.handle_outgoing_arp_reply(&request, buffer);
                if len > 0 {
                    loopback.finish_write_buffer(len, false);
                }
            }
        }
    }
}

/// Hands the reassembled datagrams of stack to the sockets. Stops at a
/// datagram for a receive buffer borrowed by its owner, it is delivered on a
/// later poll.
fn deliver<const SLOTS: usize, const BUCKETS: usize, const BUCKET_LEN: usize>(
    stack: &mut NetworkStackHandler<SLOTS, BUCKETS, BUCKET_LEN>,
    sockets: &mut SocketManager,
) {
    while let Some(datagram) = stack.latest_ipv4_packet() {
        match sockets.handle_received_packet(&datagram) {
            Ok(()) => (),
            Err(Error::Busy) => return,
            Err(err) => debug!(
                "Dropping datagram from {} with protocol {}: {:?}.",
                datagram.src_addr(),
                datagram.protocol(),
                err
            ),
        }
        stack.pop_latest_ipv4_packet();
    }
}
