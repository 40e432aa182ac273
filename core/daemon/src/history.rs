//! Bounded event history.
//!
//! Insertion-ordered, FIFO eviction, independent of session keys: events for
//! sessions that no longer exist stay here until they age out.

use eocc_protocol::Event;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct EventHistory {
    entries: VecDeque<Event>,
    capacity: usize,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Rebuilds from a persisted list (oldest first), keeping the newest
    /// entries when the list is longer than `capacity`.
    pub fn restore(events: Vec<Event>, capacity: usize) -> Self {
        let mut history = Self::new(capacity);
        for event in events {
            history.push(event);
        }
        history
    }

    /// Appends and returns the evicted entry, if any.
    pub fn push(&mut self, event: Event) -> Option<Event> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(event);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Event> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<Event> {
        self.iter().cloned().collect()
    }
}
