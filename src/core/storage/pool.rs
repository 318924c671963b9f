use crate::{
    Error,
    Result,
};

/// Handle to an element of a Pool.
pub type Index = usize;

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: Option<Index>,
    next: Option<Index>,
}

/// A doubly linked list threaded through the nodes of a Pool.
///
/// A list only stores its ends. Membership is tracked by the pool and an
/// element must be in at most one list at a time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct List {
    head: Option<Index>,
    tail: Option<Index>,
}

impl List {
    pub fn new() -> List {
        List {
            head: None,
            tail: None,
        }
    }

    pub fn head(&self) -> Option<Index> {
        self.head
    }

    pub fn tail(&self) -> Option<Index> {
        self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

/// Fixed capacity arena of T's with a free list.
///
/// Every element is either free or allocated. Allocated elements can be
/// linked into caller owned Lists. Capacity is fixed when the pool is created.
#[derive(Debug)]
pub struct Pool<T> {
    nodes: Vec<Node<T>>,
    free: Option<Index>,
    free_len: usize,
}

impl<T> Pool<T> {
    /// Creates a pool of capacity elements initialized by f, all free.
    pub fn new<F>(capacity: usize, mut f: F) -> Pool<T>
    where
        F: FnMut() -> T,
    {
        let nodes = (0 .. capacity)
            .map(|i| Node {
                value: f(),
                prev: None,
                next: if i + 1 < capacity { Some(i + 1) } else { None },
            })
            .collect();

        Pool {
            nodes,
            free: if capacity > 0 { Some(0) } else { None },
            free_len: capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the number of free elements.
    pub fn free_len(&self) -> usize {
        self.free_len
    }

    /// Takes an element from the free list.
    pub fn alloc(&mut self) -> Result<Index> {
        let idx = self.free.ok_or(Error::Exhausted)?;
        self.free = self.nodes[idx].next;
        self.free_len -= 1;
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
        Ok(idx)
    }

    /// Returns an unlinked element to the free list.
    pub fn release(&mut self, idx: Index) {
        self.nodes[idx].prev = None;
        self.nodes[idx].next = self.free;
        self.free = Some(idx);
        self.free_len += 1;
    }

    pub fn get(&self, idx: Index) -> &T {
        &self.nodes[idx].value
    }

    pub fn get_mut(&mut self, idx: Index) -> &mut T {
        &mut self.nodes[idx].value
    }

    /// Returns the successor of an element in its list.
    pub fn next(&self, idx: Index) -> Option<Index> {
        self.nodes[idx].next
    }

    pub fn push_front(&mut self, list: &mut List, idx: Index) {
        self.nodes[idx].prev = None;
        self.nodes[idx].next = list.head;
        match list.head {
            Some(head) => self.nodes[head].prev = Some(idx),
            None => list.tail = Some(idx),
        }
        list.head = Some(idx);
    }

    pub fn push_back(&mut self, list: &mut List, idx: Index) {
        self.nodes[idx].next = None;
        self.nodes[idx].prev = list.tail;
        match list.tail {
            Some(tail) => self.nodes[tail].next = Some(idx),
            None => list.head = Some(idx),
        }
        list.tail = Some(idx);
    }

    /// Unlinks an element from list and returns its former successor.
    pub fn unlink(&mut self, list: &mut List, idx: Index) -> Option<Index> {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);

        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => list.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => list.tail = prev,
        }

        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
        next
    }

    /// Puts the unlinked element new in the list position of old, leaving old
    /// unlinked.
    pub fn replace(&mut self, list: &mut List, old: Index, new: Index) {
        let (prev, next) = (self.nodes[old].prev, self.nodes[old].next);
        self.nodes[new].prev = prev;
        self.nodes[new].next = next;

        match prev {
            Some(prev) => self.nodes[prev].next = Some(new),
            None => list.head = Some(new),
        }
        match next {
            Some(next) => self.nodes[next].prev = Some(new),
            None => list.tail = Some(new),
        }

        self.nodes[old].prev = None;
        self.nodes[old].next = None;
    }

    /// Iterates over the elements of a list from head to tail.
    pub fn iter<'a>(&'a self, list: &List) -> Iter<'a, T> {
        Iter {
            pool: self,
            current: list.head,
        }
    }
}

/// Iterator over the indices of a List.
pub struct Iter<'a, T: 'a> {
    pool: &'a Pool<T>,
    current: Option<Index>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = Index;

    fn next(&mut self) -> Option<Index> {
        let idx = self.current?;
        self.current = self.pool.next(idx);
        Some(idx)
    }
}
