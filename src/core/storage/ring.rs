use crate::{
    Error,
    Result,
};

/// A bounded FIFO over a buffer of preallocated T's.
///
/// Elements are never dropped or created by the ring itself. Enqueueing
/// hands out the next vacant element to fill in place, dequeueing hands out
/// the oldest one before it becomes vacant again.
#[derive(Clone, Debug)]
pub struct Ring<T> {
    buffer: Vec<T>,
    begin: usize,
    len: usize,
}

impl<T> From<Vec<T>> for Ring<T> {
    fn from(buffer: Vec<T>) -> Ring<T> {
        Ring {
            buffer,
            begin: 0,
            len: 0,
        }
    }
}

impl<T> Ring<T> {
    fn vacant_idx(&self) -> Option<usize> {
        if self.len == self.buffer.len() {
            None
        } else {
            Some((self.begin + self.len) % self.buffer.len())
        }
    }

    /// Applies f on the oldest element and dequeues it.
    pub fn dequeue_with<'a, F, R>(&'a mut self, f: F) -> Result<R>
    where
        F: FnOnce(&'a mut T) -> R,
    {
        if self.len == 0 {
            return Err(Error::Exhausted);
        }

        let idx = self.begin;
        self.begin = (self.begin + 1) % self.buffer.len();
        self.len -= 1;
        Ok(f(&mut self.buffer[idx]))
    }

    /// Lets f fill in the vacant element and enqueues it unless f fails.
    pub fn enqueue_maybe<'a, F, R>(&'a mut self, f: F) -> Result<R>
    where
        F: FnOnce(&'a mut T) -> Result<R>,
    {
        let idx = self.vacant_idx().ok_or(Error::Exhausted)?;
        let res = f(&mut self.buffer[idx])?;
        self.len += 1;
        Ok(res)
    }

    /// Returns the oldest element without dequeuing it.
    pub fn head(&self) -> Result<&T> {
        if self.len == 0 {
            return Err(Error::Exhausted);
        }

        Ok(&self.buffer[self.begin])
    }

    /// Returns the element the next enqueue_maybe(...) will hand out, so it
    /// can be filled before the enqueue commits it.
    pub fn vacant_mut(&mut self) -> Result<&mut T> {
        let idx = self.vacant_idx().ok_or(Error::Exhausted)?;
        Ok(&mut self.buffer[idx])
    }

    /// Iterates over the queued elements, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        (0 .. self.len).map(move |i| &self.buffer[(self.begin + i) % self.buffer.len()])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}
