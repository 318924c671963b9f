use spin::Mutex;

use crate::core::storage::Ring;
use crate::{
    Error,
    Result,
};

/// A bounded queue moving values from one execution context to another.
///
/// One side only pushes and the other only pops. The lock guards a single
/// ring and is held for one push, one pop or one batch, never across any
/// other work, so an interrupt handler spinning on it waits for at most that
/// operation.
#[derive(Debug)]
pub struct Handoff<T> {
    ring: Mutex<Ring<Option<T>>>,
}

impl<T> Handoff<T> {
    pub fn new(capacity: usize) -> Handoff<T> {
        let buffer = (0 .. capacity).map(|_| None).collect::<Vec<_>>();
        Handoff {
            ring: Mutex::new(Ring::from(buffer)),
        }
    }

    /// Queues value, handing it back if the queue is full.
    pub fn push(&self, value: T) -> std::result::Result<(), T> {
        let mut ring = self.ring.lock();
        if ring.len() == ring.capacity() {
            return Err(value);
        }

        let _ = ring.enqueue_maybe(|slot| {
            *slot = Some(value);
            Ok(())
        });
        Ok(())
    }

    /// Queues the first count values of values as one batch, the consumer
    /// never observes part of it. Fails without consuming anything when
    /// there is no room for count values.
    pub fn push_all<I>(&self, count: usize, values: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
    {
        let mut ring = self.ring.lock();
        if ring.capacity() - ring.len() < count {
            return Err(Error::Exhausted);
        }

        for value in values.into_iter().take(count) {
            ring.enqueue_maybe(|slot| {
                *slot = Some(value);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Takes the oldest value.
    pub fn pop(&self) -> Option<T> {
        self.ring.lock().dequeue_with(|slot| slot.take()).ok()?
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Counts the queued values matching f.
    pub fn count<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        self.ring
            .lock()
            .iter()
            .filter(|slot| slot.as_ref().map_or(false, |value| f(value)))
            .count()
    }
}
