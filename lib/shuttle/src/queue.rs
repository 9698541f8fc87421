//! Priority structure ordered by (timestamp, uid) ascending.
//!
//! The queue itself is a plain data structure: all mutation is serialized by
//! the scheduler's mutex, which the ingress thread shares.

use crate::event::{EventKey, ScheduledEvent};
use std::collections::BTreeMap;

pub(crate) struct EventQueue {
    events: BTreeMap<EventKey, ScheduledEvent>,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue {
            events: BTreeMap::new(),
        }
    }

    /// Inserts an event. Keys are unique by construction (uids are never
    /// reused within a run).
    #[inline]
    pub fn insert(&mut self, key: EventKey, event: ScheduledEvent) {
        let displaced = self.events.insert(key, event);
        debug_assert!(displaced.is_none(), "duplicate event key {:?}", key);
    }

    /// Key of the earliest event without removing it.
    #[inline]
    pub fn peek_key(&self) -> Option<EventKey> {
        self.events.keys().next().copied()
    }

    /// Removes and returns the earliest event.
    #[inline]
    pub fn pop(&mut self) -> Option<(EventKey, ScheduledEvent)> {
        self.events.pop_first()
    }

    /// Removes the event with the given key, if present.
    #[inline]
    pub fn remove(&mut self, key: &EventKey) -> Option<ScheduledEvent> {
        self.events.remove(key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
