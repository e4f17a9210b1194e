//! Deduplicating recency ring.
//!
//! Nodes live in a fixed arena indexed by position; order is kept with
//! prev/next indices and a hash index maps an item's key to its node. Freed
//! slots are recycled through a free list, so the arena never grows past the
//! capacity it was created with. At most [`PREALLOCATED_SLOTS`] slots are
//! reserved up front; a larger ring fills its arena as items arrive.

use super::Origin;
use crate::types::Timestamp;
use std::collections::{HashMap, VecDeque};

/// Upper bound on the slots reserved when a ring is created.
pub const PREALLOCATED_SLOTS: usize = 1 << 16;

/// Something that can live in a [`HistoryRing`].
pub trait RingItem {
    /// Deduplication key.
    fn key(&self) -> &str;
    fn timestamp(&self) -> Timestamp;
}

#[derive(Debug)]
struct Node<T> {
    item: T,
    origin: Origin,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Fixed-capacity list ordered by ascending timestamp with unique keys.
#[derive(Debug)]
pub struct HistoryRing<T> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    capacity: usize,
}

impl<T: RingItem> HistoryRing<T> {
    pub fn new(capacity: usize) -> Self {
        let reserved = capacity.min(PREALLOCATED_SLOTS);
        Self {
            slots: Vec::with_capacity(reserved),
            free: Vec::new(),
            index: HashMap::with_capacity(reserved),
            head: None,
            tail: None,
            len: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert an item, keeping keys unique and the list sorted.
    ///
    /// A duplicate key keeps the newer item. On equal timestamps an item from
    /// the running session replaces one read from a file, never the other way
    /// round. When full, the oldest item is evicted, unless the new item would
    /// itself be the oldest, in which case nothing changes.
    pub fn insert(&mut self, item: T, origin: Origin) {
        if self.capacity == 0 {
            return;
        }
        if let Some(&existing) = self.index.get(item.key()) {
            let node = self.node(existing);
            let (existing_ts, existing_origin) = (node.item.timestamp(), node.origin);
            if item.timestamp() > existing_ts {
                self.remove(existing);
            } else if item.timestamp() == existing_ts
                && origin == Origin::Session
                && existing_origin == Origin::File
            {
                let node = self.node_mut(existing);
                node.item = item;
                node.origin = origin;
                return;
            } else {
                return;
            }
        }

        // Last node not newer than the item; the item goes right after it.
        let mut after = self.tail;
        while let Some(idx) = after {
            let node = self.node(idx);
            if node.item.timestamp() <= item.timestamp() {
                break;
            }
            after = node.prev;
        }

        if self.len == self.capacity {
            let Some(head) = self.head else {
                return;
            };
            match after {
                None => return,
                Some(idx) if idx == head => after = None,
                Some(_) => {}
            }
            self.remove(head);
        }
        self.link_after(after, item, origin);
    }

    /// Items oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = (&T, Origin)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let idx = cursor?;
            let node = self.node(idx);
            cursor = node.next;
            Some((&node.item, node.origin))
        })
    }

    /// Consume the ring, yielding items oldest to newest.
    pub fn drain_in_order(mut self) -> Vec<(T, Origin)> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let Some(node) = self.slots[idx].take() else {
                break;
            };
            cursor = node.next;
            out.push((node.item, node.origin));
        }
        out
    }

    fn node(&self, idx: usize) -> &Node<T> {
        self.slots[idx]
            .as_ref()
            .unwrap_or_else(|| panic!("history ring slot {idx} is vacant"))
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<T> {
        self.slots[idx]
            .as_mut()
            .unwrap_or_else(|| panic!("history ring slot {idx} is vacant"))
    }

    fn link_after(&mut self, after: Option<usize>, item: T, origin: Origin) {
        let next = match after {
            Some(idx) => self.node(idx).next,
            None => self.head,
        };
        let key = item.key().to_string();
        let node = Node {
            item,
            origin,
            prev: after,
            next,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        match after {
            Some(prev) => self.node_mut(prev).next = Some(idx),
            None => self.head = Some(idx),
        }
        match next {
            Some(next) => self.node_mut(next).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.index.insert(key, idx);
        self.len += 1;
    }

    fn remove(&mut self, idx: usize) {
        let Some(node) = self.slots[idx].take() else {
            return;
        };
        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }
        self.index.remove(node.item.key());
        self.free.push(idx);
        self.len -= 1;
    }
}

/// A [`HistoryRing`] seeded with the session's own history.
///
/// Session items are fed in lazily: before a file item goes in, every session
/// item older than it is inserted first, so the ring always sees items in
/// roughly chronological order and evicts the genuinely oldest ones.
#[derive(Debug)]
pub struct HistoryMerger<T> {
    ring: HistoryRing<T>,
    pending: VecDeque<T>,
}

impl<T: RingItem> HistoryMerger<T> {
    /// `session` must be ordered oldest to newest.
    pub fn new(capacity: usize, session: Vec<T>) -> Self {
        Self {
            ring: HistoryRing::new(capacity),
            pending: session.into(),
        }
    }

    /// Merge one item read from a file.
    pub fn insert_from_file(&mut self, item: T) {
        while self
            .pending
            .front()
            .is_some_and(|p| p.timestamp() < item.timestamp())
        {
            if let Some(session_item) = self.pending.pop_front() {
                self.ring.insert(session_item, Origin::Session);
            }
        }
        self.ring.insert(item, Origin::File);
    }

    /// Flush the remaining session items and return the merged list.
    pub fn finish(mut self) -> Vec<(T, Origin)> {
        while let Some(item) = self.pending.pop_front() {
            self.ring.insert(item, Origin::Session);
        }
        self.ring.drain_in_order()
    }
}
