//! Event identities and payloads.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Simulated time in nanoseconds.
pub type Timestamp = u64;
/// Monotonic per-run event uid. Breaks timestamp ties, earlier uid first.
pub type EventUid = u32;
/// Opaque tag carried alongside an event, not interpreted by the scheduler.
pub type ContextId = u32;

pub const UID_INVALID: EventUid = 0;
pub const UID_NOW: EventUid = 1;
pub const UID_DESTROY: EventUid = 2;
/// Uids 0-3 are reserved; dynamic allocation starts here.
pub const UID_FIRST_DYNAMIC: EventUid = 4;

/// Context assigned to events that do not belong to any simulated node.
pub const CONTEXT_NONE: ContextId = 0xffff_ffff;

/// Queue ordering key. Derived ordering is lexicographic over (ts, uid),
/// which is exactly the execution order contract.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventKey {
    pub ts: Timestamp,
    pub uid: EventUid,
}

pub type EventFn = Box<dyn FnOnce() + Send>;

/// Shared cancellation state. Cancelling is a lazy O(1) bit flip; the queue
/// reclaims cancelled events when they are dequeued.
#[derive(Debug, Default)]
pub struct EventState {
    cancelled: AtomicBool,
}

impl EventState {
    #[inline]
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// An event sitting in the queue.
pub(crate) struct ScheduledEvent {
    pub context: ContextId,
    pub state: Arc<EventState>,
    pub callback: EventFn,
}

/// An event queued for teardown. Runs at destroy time in insertion order.
pub(crate) struct DestroyEvent {
    pub state: Arc<EventState>,
    pub callback: EventFn,
}

/// Handle to a scheduled event, used for cancellation, removal and expiry
/// queries. Cloning is cheap; all clones refer to the same event.
#[derive(Clone)]
pub struct EventId {
    key: EventKey,
    context: ContextId,
    state: Arc<EventState>,
}

impl EventId {
    #[inline]
    pub(crate) fn new(key: EventKey, context: ContextId, state: Arc<EventState>) -> EventId {
        EventId {
            key,
            context,
            state,
        }
    }

    #[inline]
    pub fn ts(&self) -> Timestamp {
        self.key.ts
    }

    #[inline]
    pub fn uid(&self) -> EventUid {
        self.key.uid
    }

    #[inline]
    pub fn context(&self) -> ContextId {
        self.context
    }

    #[inline]
    pub(crate) fn key(&self) -> EventKey {
        self.key
    }

    #[inline]
    pub(crate) fn state(&self) -> &Arc<EventState> {
        &self.state
    }

    /// True if this id and `other` refer to the same scheduled event.
    #[inline]
    pub fn same_event(&self, other: &EventId) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventId")
            .field("ts", &self.key.ts)
            .field("uid", &self.key.uid)
            .field("context", &self.context)
            .field("cancelled", &self.state.is_cancelled())
            .finish()
    }
}
