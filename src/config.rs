//! Interface addressing and timeout configuration.

use crate::core::repr::{
    EthernetAddress,
    Ipv4Address,
};

/// Netmask length used when a configured one is out of range.
pub const DEFAULT_NETMASK_LEN: u8 = 24;

/// MAC address of the loopback interface.
pub const LOOPBACK_MAC: EthernetAddress = EthernetAddress::new([1, 2, 3, 4, 5, 6]);

/// Addressing of one network interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub mac: EthernetAddress,
    pub ipv4_addr: Ipv4Address,
    pub gateway: Ipv4Address,
    pub netmask_len: u8,
}

impl InterfaceConfig {
    /// Creates a configuration, netmask lengths above 32 fall back to 24.
    pub fn new(
        mac: EthernetAddress,
        ipv4_addr: Ipv4Address,
        gateway: Ipv4Address,
        netmask_len: u8,
    ) -> InterfaceConfig {
        let netmask_len = if netmask_len > 32 {
            warn!(
                "Invalid netmask length {}, using /{}.",
                netmask_len, DEFAULT_NETMASK_LEN
            );
            DEFAULT_NETMASK_LEN
        } else {
            netmask_len
        };

        InterfaceConfig {
            mac,
            ipv4_addr,
            gateway,
            netmask_len,
        }
    }

    /// Configuration of the loopback interface of a host with address
    /// ipv4_addr. Every destination is the host itself.
    pub fn loopback(ipv4_addr: Ipv4Address) -> InterfaceConfig {
        InterfaceConfig::new(LOOPBACK_MAC, ipv4_addr, ipv4_addr, 32)
    }
}

/// Tick thresholds used by a network stack handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Age after which an incomplete datagram is dropped.
    pub fragment: u32,
    /// Age after which a requested but never used ARP entry may be reused.
    pub unused_arp_entry: u32,
    /// Time to wait for an ARP reply before falling back to broadcast.
    pub arp_request: u32,
    /// Age after which an answered ARP entry is requested again.
    pub arp_entry: u32,
    /// End of the broadcast fallback window, the request is resent after it.
    pub arp_broadcast_on_failure: u32,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            fragment: 10,
            unused_arp_entry: 15,
            arp_request: 10,
            arp_entry: 120,
            arp_broadcast_on_failure: 15,
        }
    }
}
