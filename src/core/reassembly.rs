//! IPv4 reassembly over a fixed set of fragment slots.
//!
//! The work is split between a `Reassembler`, driven by the receive
//! interrupt, and a `ReadyQueue`, drained by the network task. Every slot
//! buffer is in exactly one place:
//!
//! - unused: the spare buffers of the reassembler or the free handoff the
//!   task returns consumed buffers through,
//! - incomplete: a chain of the reassembler's incomplete list, one chain per
//!   datagram still missing fragments, oldest first,
//! - ready: the ready handoff holding complete datagrams as runs of slots in
//!   offset order, or the datagram the task is reading.
//!
//! The two halves only meet in the two handoffs. Complete chains are handed
//! over as one batch and only the task frees ready slots.

use std::sync::Arc;

use crate::core::repr::Ipv4Address;
use crate::core::storage::{
    Handoff,
    Index,
    List,
    Pool,
};
use crate::core::time::{
    Clock,
    Instant,
};
use crate::{
    Error,
    Result,
};

/// Payload capacity of a single slot.
pub const SLOT_CAPACITY: usize = 2048;

/// Header fields of a received fragment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Fragment {
    pub src_addr: Ipv4Address,
    pub dst_addr: Ipv4Address,
    pub protocol: u8,
    pub identification: u16,
    pub more_fragments: bool,
    /// Offset of the payload in the datagram, in bytes.
    pub fragment_offset: usize,
    pub data_len: usize,
}

impl Fragment {
    fn same_datagram(&self, other: &Fragment) -> bool {
        self.src_addr == other.src_addr
            && self.dst_addr == other.dst_addr
            && self.identification == other.identification
    }
}

/// A fragment of a complete datagram.
#[derive(Debug)]
struct Slot {
    fragment: Fragment,
    data: Box<[u8]>,
}

/// A fragment of an incomplete datagram.
#[derive(Debug)]
struct Node {
    fragment: Fragment,
    /// Arrival of the datagram's first fragment.
    created: Instant,
    next_fragment: Option<Index>,
    data: Option<Box<[u8]>>,
}

#[derive(Debug)]
struct Shared {
    free: Handoff<Box<[u8]>>,
    ready: Handoff<Slot>,
}

/// Number of slots and datagrams in each state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolUsage {
    pub unused_slots: usize,
    pub incomplete_datagrams: usize,
    pub incomplete_slots: usize,
    pub ready_datagrams: usize,
    pub ready_slots: usize,
}

impl PoolUsage {
    /// Total number of slots, equal to the pool capacity whenever neither
    /// half is in the middle of an operation.
    pub fn total_slots(&self) -> usize {
        self.unused_slots + self.incomplete_slots + self.ready_slots
    }
}

/// Creates the two halves of a reassembly pool of capacity slots.
pub fn reassembly_queues(capacity: usize) -> (Reassembler, ReadyQueue) {
    let shared = Arc::new(Shared {
        free: Handoff::new(capacity),
        ready: Handoff::new(capacity),
    });

    let reassembler = Reassembler {
        shared: shared.clone(),
        spare: (0 .. capacity)
            .map(|_| vec![0; SLOT_CAPACITY].into_boxed_slice())
            .collect(),
        nodes: Pool::new(capacity, || Node {
            fragment: Fragment::default(),
            created: Instant::default(),
            next_fragment: None,
            data: None,
        }),
        incomplete: List::new(),
    };

    let ready = ReadyQueue {
        shared,
        current: Vec::with_capacity(capacity),
    };

    (reassembler, ready)
}

/// The receive half: files fragments and hands complete datagrams over.
#[derive(Debug)]
pub struct Reassembler {
    shared: Arc<Shared>,
    spare: Vec<Box<[u8]>>,
    nodes: Pool<Node>,
    incomplete: List,
}

impl Reassembler {
    fn take_buffer(&mut self) -> Option<Box<[u8]>> {
        self.spare.pop().or_else(|| self.shared.free.pop())
    }

    /// Stores a fragment and its payload.
    ///
    /// When no slot is free the oldest incomplete datagram is dropped to make
    /// room. Fails with Exhausted if every slot holds a complete datagram and
    /// with Malformed if the fragment can't be placed in its datagram.
    pub fn insert(
        &mut self,
        fragment: Fragment,
        payload: &[u8],
        clock: &Clock,
        fragment_timeout: u32,
    ) -> Result<()> {
        if payload.len() > SLOT_CAPACITY || payload.len() != fragment.data_len {
            return Err(Error::Malformed);
        }

        let mut data = match self.take_buffer() {
            Some(data) => data,
            None => {
                let oldest = self.incomplete.head().ok_or(Error::Exhausted)?;
                debug!(
                    "Dropping incomplete datagram {} from {} to make room.",
                    self.nodes.get(oldest).fragment.identification,
                    self.nodes.get(oldest).fragment.src_addr
                );
                self.nodes.unlink(&mut self.incomplete, oldest);
                self.release_chain(oldest);
                self.take_buffer().ok_or(Error::Exhausted)?
            }
        };
        data[.. payload.len()].copy_from_slice(payload);

        if !fragment.more_fragments && fragment.fragment_offset == 0 {
            return match self.shared.ready.push(Slot { fragment, data }) {
                Ok(()) => Ok(()),
                Err(slot) => {
                    self.spare.push(slot.data);
                    Err(Error::Exhausted)
                }
            };
        }

        let idx = match self.nodes.alloc() {
            Ok(idx) => idx,
            Err(err) => {
                self.spare.push(data);
                return Err(err);
            }
        };
        *self.nodes.get_mut(idx) = Node {
            fragment,
            created: clock.now(),
            next_fragment: None,
            data: Some(data),
        };

        let res = self.insert_fragment(idx, clock, fragment_timeout);
        if res.is_err() {
            self.release_chain(idx);
        }
        res
    }

    fn insert_fragment(&mut self, idx: Index, clock: &Clock, fragment_timeout: u32) -> Result<()> {
        let fragment = self.nodes.get(idx).fragment;

        // Find the datagram, dropping timed out ones on the way.
        let mut head = None;
        let mut cursor = self.incomplete.head();
        while let Some(chain) = cursor {
            cursor = self.nodes.next(chain);

            let node = self.nodes.get(chain);
            if clock.elapsed(node.created) > fragment_timeout {
                debug!(
                    "Dropping timed out datagram {} from {}.",
                    node.fragment.identification, node.fragment.src_addr
                );
                self.nodes.unlink(&mut self.incomplete, chain);
                self.release_chain(chain);
            } else if node.fragment.same_datagram(&fragment) {
                head = Some(chain);
                break;
            }
        }

        let head = match head {
            Some(head) => head,
            None => {
                self.nodes.push_back(&mut self.incomplete, idx);
                return Ok(());
            }
        };

        let mut complete_so_far = true;
        let mut previous: Option<Index> = None;
        let mut previous_end = 0;
        let mut current = Some(head);
        while let Some(c) = current {
            let node = self.nodes.get(c);
            if node.fragment.fragment_offset >= fragment.fragment_offset {
                break;
            }
            if node.fragment.fragment_offset != previous_end {
                complete_so_far = false;
            }
            // Nothing can follow the last fragment.
            if !node.fragment.more_fragments {
                return Err(Error::Malformed);
            }

            previous = Some(c);
            previous_end = node.fragment.fragment_offset + node.fragment.data_len;
            current = node.next_fragment;
        }

        let chain_head = match (previous, current) {
            (None, Some(old_head)) => {
                if !fragment.more_fragments {
                    return Err(Error::Malformed);
                }
                let created = self.nodes.get(old_head).created;
                let node = self.nodes.get_mut(idx);
                node.created = created;
                node.next_fragment = Some(old_head);
                self.nodes.replace(&mut self.incomplete, old_head, idx);
                idx
            }
            (Some(previous), None) => {
                self.nodes.get_mut(previous).next_fragment = Some(idx);
                head
            }
            (Some(previous), Some(current)) => {
                if !fragment.more_fragments {
                    return Err(Error::Malformed);
                }
                self.nodes.get_mut(idx).next_fragment = Some(current);
                self.nodes.get_mut(previous).next_fragment = Some(idx);
                head
            }
            (None, None) => unreachable!("a datagram chain is never empty"),
        };

        let mut last_more_fragments = true;
        let mut current = Some(idx);
        while let (true, Some(c)) = (complete_so_far, current) {
            let node = self.nodes.get(c);
            if node.fragment.fragment_offset != previous_end {
                complete_so_far = false;
            }
            previous_end = node.fragment.fragment_offset + node.fragment.data_len;
            last_more_fragments = node.fragment.more_fragments;
            current = node.next_fragment;
        }

        if complete_so_far && current.is_none() && !last_more_fragments {
            self.nodes.unlink(&mut self.incomplete, chain_head);
            self.hand_over(chain_head);
        }

        Ok(())
    }

    /// Moves an unlinked complete chain to the ready handoff.
    fn hand_over(&mut self, head: Index) {
        let len = self.chain_len(head);
        let nodes = &mut self.nodes;
        let mut current = Some(head);
        let slots = std::iter::from_fn(|| {
            let c = current?;
            let node = nodes.get_mut(c);
            current = node.next_fragment.take();
            let fragment = node.fragment;
            let data = node.data.take();
            nodes.release(c);
            data.map(|data| Slot { fragment, data })
        });

        // Ready holds as many slots as there are buffers, so only a broken
        // count gets here.
        if self.shared.ready.push_all(len, slots).is_err() {
            warn!("Ready queue is full, keeping the datagram incomplete.");
            self.nodes.push_back(&mut self.incomplete, head);
        }
    }

    fn release_chain(&mut self, head: Index) {
        let mut current = Some(head);
        while let Some(c) = current {
            let node = self.nodes.get_mut(c);
            current = node.next_fragment.take();
            if let Some(data) = node.data.take() {
                self.spare.push(data);
            }
            self.nodes.release(c);
        }
    }

    fn chain_len(&self, head: Index) -> usize {
        let mut len = 0;
        let mut current = Some(head);
        while let Some(c) = current {
            len += 1;
            current = self.nodes.get(c).next_fragment;
        }
        len
    }

    /// Unused and incomplete slots. Ready slots are counted by the
    /// ReadyQueue.
    pub fn usage(&self) -> PoolUsage {
        let mut usage = PoolUsage {
            unused_slots: self.spare.len() + self.shared.free.len(),
            ..PoolUsage::default()
        };

        for head in self.nodes.iter(&self.incomplete) {
            usage.incomplete_datagrams += 1;
            usage.incomplete_slots += self.chain_len(head);
        }

        usage
    }
}

/// The task half: reads complete datagrams in completion order.
#[derive(Debug)]
pub struct ReadyQueue {
    shared: Arc<Shared>,
    /// Slots of the datagram being read, in offset order.
    current: Vec<Slot>,
}

impl ReadyQueue {
    /// Pulls slots until current holds a whole datagram.
    fn fill(&mut self) -> bool {
        loop {
            if let Some(last) = self.current.last() {
                if !last.fragment.more_fragments {
                    return true;
                }
            }
            match self.shared.ready.pop() {
                Some(slot) => self.current.push(slot),
                None => return false,
            }
        }
    }

    /// Returns the oldest complete datagram.
    pub fn latest(&mut self) -> Option<Datagram> {
        if self.fill() {
            Some(Datagram {
                slots: &self.current,
            })
        } else {
            None
        }
    }

    /// Drops the oldest complete datagram, returning whether there was one.
    pub fn pop_latest(&mut self) -> bool {
        if !self.fill() {
            return false;
        }

        for slot in self.current.drain(..) {
            if self.shared.free.push(slot.data).is_err() {
                warn!("Free queue is full, losing a reassembly slot.");
            }
        }
        true
    }

    /// Ready slots and datagrams. Unused and incomplete slots are counted by
    /// the Reassembler.
    pub fn usage(&self) -> PoolUsage {
        let reading = !self.current.is_empty();
        PoolUsage {
            ready_datagrams: reading as usize
                + self.shared.ready.count(|slot| !slot.fragment.more_fragments),
            ready_slots: self.current.len() + self.shared.ready.len(),
            ..PoolUsage::default()
        }
    }
}

/// A reassembled datagram, borrowed from the ReadyQueue.
#[derive(Clone, Copy)]
pub struct Datagram<'a> {
    /// Never empty.
    slots: &'a [Slot],
}

impl<'a> Datagram<'a> {
    /// Header fields of the first fragment.
    pub fn header(&self) -> &'a Fragment {
        &self.slots[0].fragment
    }

    pub fn src_addr(&self) -> Ipv4Address {
        self.header().src_addr
    }

    pub fn dst_addr(&self) -> Ipv4Address {
        self.header().dst_addr
    }

    pub fn protocol(&self) -> u8 {
        self.header().protocol
    }

    /// Sum of the payload sizes of all fragments.
    pub fn len(&self) -> usize {
        self.fragments().map(|(_, payload)| payload.len()).sum()
    }

    /// Iterates over the fragments in offset order.
    pub fn fragments(&self) -> Fragments<'a> {
        Fragments {
            slots: self.slots.iter(),
        }
    }
}

/// Iterator over the fragments of a datagram and their payloads.
pub struct Fragments<'a> {
    slots: std::slice::Iter<'a, Slot>,
}

impl<'a> Iterator for Fragments<'a> {
    type Item = (&'a Fragment, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.slots.next()?;
        Some((&slot.fragment, &slot.data[.. slot.fragment.data_len]))
    }
}
