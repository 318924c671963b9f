use std::ops::Range;

use crate::core::repr::{
    EthernetAddress,
    Ipv4Address,
};
use crate::core::time::{
    Clock,
    Instant,
};

/// An IPv4 -> ethernet address mapping and its request/answer history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArpEntry {
    /// None while the entry has never been assigned.
    pub ip: Option<Ipv4Address>,
    pub mac: EthernetAddress,
    pub last_used: Option<Instant>,
    pub last_requested: Option<Instant>,
    pub last_answered: Option<Instant>,
}

impl ArpEntry {
    fn for_ip(ip: Ipv4Address) -> ArpEntry {
        ArpEntry {
            ip: Some(ip),
            ..ArpEntry::default()
        }
    }
}

/// A fixed hash table of ARP entries with `buckets` buckets of `bucket_len`
/// entries each. An address only ever lives in the bucket it hashes to.
#[derive(Debug)]
pub struct ArpTable {
    entries: Vec<ArpEntry>,
    buckets: usize,
    bucket_len: usize,
}

impl ArpTable {
    /// Creates an empty table.
    ///
    /// # Panics
    ///
    /// Causes a panic if either dimension is 0.
    pub fn new(buckets: usize, bucket_len: usize) -> ArpTable {
        assert!(buckets > 0 && bucket_len > 0, "ARP table without entries");

        ArpTable {
            entries: vec![ArpEntry::default(); buckets * bucket_len],
            buckets,
            bucket_len,
        }
    }

    fn bucket(&self, ip: Ipv4Address) -> Range<usize> {
        let bucket = (u32::from(ip) as usize) % self.buckets;
        bucket * self.bucket_len .. (bucket + 1) * self.bucket_len
    }

    /// Lookup the entry for an IPv4 address.
    pub fn entry(&self, ip: Ipv4Address) -> Option<&ArpEntry> {
        self.entries[self.bucket(ip)]
            .iter()
            .find(|entry| entry.ip == Some(ip))
    }

    /// Records an ARP answer for ip if the table holds an entry for it.
    /// Answers for addresses we never asked about are not cached.
    pub fn update_from_reply(&mut self, ip: Ipv4Address, mac: EthernetAddress, now: Instant) -> bool {
        let bucket = self.bucket(ip);
        match self.entries[bucket].iter_mut().find(|entry| entry.ip == Some(ip)) {
            Some(entry) => {
                entry.mac = mac;
                entry.last_answered = Some(now);
                true
            }
            None => false,
        }
    }

    /// Returns the entry to use for ip, taking over another entry of its
    /// bucket when ip has none.
    ///
    /// The entry for ip itself always wins. Otherwise the candidates are, in
    /// order of preference, a never assigned entry, then a requested but
    /// never used entry older than unused_timeout, then the least recently
    /// used entry. Returns None when the bucket only holds recently requested
    /// entries that were never used. A taken over entry starts with no
    /// history.
    pub fn select(
        &mut self,
        ip: Ipv4Address,
        clock: &Clock,
        unused_timeout: u32,
    ) -> Option<&mut ArpEntry> {
        let mut chosen: Option<usize> = None;

        for i in self.bucket(ip) {
            let entry = &self.entries[i];
            if entry.ip == Some(ip) {
                chosen = Some(i);
                break;
            }

            // A never assigned entry can't be beaten, keep scanning for ip only.
            if let Some(c) = chosen {
                if self.entries[c].ip.is_none() {
                    continue;
                }
            }

            let candidate = if entry.ip.is_none() {
                true
            } else if let Some(last_used) = entry.last_used {
                match chosen {
                    None => true,
                    Some(c) => match self.entries[c].last_used {
                        Some(chosen_used) => clock.elapsed(last_used) > clock.elapsed(chosen_used),
                        None => false,
                    },
                }
            } else {
                match entry.last_requested {
                    Some(last_requested) => clock.elapsed(last_requested) > unused_timeout,
                    None => true,
                }
            };

            if candidate {
                chosen = Some(i);
            }
        }

        let entry = &mut self.entries[chosen?];
        if entry.ip != Some(ip) {
            if let Some(evicted) = entry.ip {
                debug!("Evicting ARP entry for {} in favour of {}.", evicted, ip);
            }
            *entry = ArpEntry::for_ip(ip);
        }

        Some(entry)
    }
}
