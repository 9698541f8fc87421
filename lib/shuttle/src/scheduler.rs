//! The synchronized event loop.
//!
//! One main thread drives the queue; at most one ingress thread inserts
//! events concurrently. All shared state sits behind a single mutex, which is
//! never held across an event invocation or the blocking permission wait.

use crate::event::{
    ContextId, DestroyEvent, EventId, EventKey, EventState, EventUid, ScheduledEvent, Timestamp,
    CONTEXT_NONE, UID_DESTROY, UID_FIRST_DYNAMIC,
};
use crate::queue::EventQueue;
use fabric::logging;
use fabric::result::Result;
use fabric::session::Session;
use fabric::time::elapsed_micros;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

/// Client side of the barrier protocol, as consumed by the scheduler. The
/// production implementation is `fabric::session::Session`.
pub trait SyncLink {
    fn connect_and_register(&mut self) -> Result<()>;
    fn send_finished(&mut self, run_time: u32, real_time: u32) -> Result<()>;
    /// Blocks until a fresh run permission arrives; returns its run-time in
    /// microseconds.
    fn wait_for_run_permission(&mut self) -> Result<u32>;
    fn unregister_and_disconnect(&mut self) -> Result<()>;
}

impl SyncLink for Session {
    fn connect_and_register(&mut self) -> Result<()> {
        Session::connect_and_register(self)
    }

    fn send_finished(&mut self, run_time: u32, real_time: u32) -> Result<()> {
        Session::send_finished(self, run_time, real_time)
    }

    fn wait_for_run_permission(&mut self) -> Result<u32> {
        Session::wait_for_run_permission(self)
    }

    fn unregister_and_disconnect(&mut self) -> Result<()> {
        Session::unregister_and_disconnect(self)
    }
}

pub(crate) struct Core {
    queue: EventQueue,
    destroy: Vec<DestroyEvent>,

    current_ts: Timestamp,
    current_uid: EventUid,
    current_context: ContextId,
    next_uid: EventUid,

    /// Exclusive virtual-time ceiling: an event at exactly `barrier_ts`
    /// belongs to the next slice.
    barrier_ts: Timestamp,
    waiting_for_permission: bool,
    new_event_arrived: bool,
    stop: bool,
}

impl Core {
    fn new() -> Core {
        Core {
            queue: EventQueue::new(),
            destroy: Vec::new(),
            current_ts: 0,
            current_uid: 0,
            current_context: CONTEXT_NONE,
            next_uid: UID_FIRST_DYNAMIC,
            barrier_ts: 0,
            waiting_for_permission: false,
            new_event_arrived: false,
            stop: false,
        }
    }

    #[inline]
    fn alloc_uid(&mut self) -> EventUid {
        let uid = self.next_uid;
        self.next_uid += 1;
        uid
    }

    fn insert<F: FnOnce() + Send + 'static>(
        &mut self,
        ts: Timestamp,
        context: ContextId,
        callback: F,
    ) -> EventId {
        let key = EventKey {
            ts,
            uid: self.alloc_uid(),
        };
        let state = Arc::new(EventState::default());

        self.queue.insert(
            key,
            ScheduledEvent {
                context,
                state: state.clone(),
                callback: Box::new(callback),
            },
        );
        self.new_event_arrived = true;

        EventId::new(key, context, state)
    }
}

/// Cloneable front door to the scheduler. The ingress thread and simulation
/// callbacks schedule through this.
#[derive(Clone)]
pub struct SchedulerHandle {
    core: Arc<Mutex<Core>>,
    log: logging::Logger,
}

impl SchedulerHandle {
    #[inline]
    fn lock(&self) -> MutexGuard<Core> {
        self.core.lock().expect("scheduler mutex poisoned")
    }

    /// Current simulated time in nanoseconds.
    #[inline]
    pub fn now(&self) -> Timestamp {
        self.lock().current_ts
    }

    /// Context of the event being executed.
    #[inline]
    pub fn context(&self) -> ContextId {
        self.lock().current_context
    }

    /// Schedules `callback` at `delay` nanoseconds after the current
    /// simulated time, tagged with the current context.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, delay: Timestamp, callback: F) -> EventId {
        let mut core = self.lock();
        let ts = core.current_ts + delay;
        let context = core.current_context;
        core.insert(ts, context, callback)
    }

    pub fn schedule_with_context<F: FnOnce() + Send + 'static>(
        &self,
        context: ContextId,
        delay: Timestamp,
        callback: F,
    ) -> EventId {
        let mut core = self.lock();
        let ts = core.current_ts + delay;
        core.insert(ts, context, callback)
    }

    /// Schedules at the current timestamp, strictly after every event with
    /// the same timestamp that has already been processed.
    pub fn schedule_now<F: FnOnce() + Send + 'static>(&self, callback: F) -> EventId {
        let mut core = self.lock();
        let ts = core.current_ts;
        let context = core.current_context;
        core.insert(ts, context, callback)
    }

    /// Schedules into the currently authorized slice. While the scheduler is
    /// blocked waiting for a grant the event lands at the start of the slice
    /// about to begin; during active processing it lands at the end of the
    /// running slice, after everything already scheduled in it.
    pub fn schedule_in_current_slice<F: FnOnce() + Send + 'static>(&self, callback: F) -> EventId {
        let mut core = self.lock();
        let context = core.current_context;
        Self::insert_in_current_slice(&mut core, context, callback, &self.log)
    }

    pub fn schedule_in_current_slice_with_context<F: FnOnce() + Send + 'static>(
        &self,
        context: ContextId,
        callback: F,
    ) -> EventId {
        let mut core = self.lock();
        Self::insert_in_current_slice(&mut core, context, callback, &self.log)
    }

    fn insert_in_current_slice<F: FnOnce() + Send + 'static>(
        core: &mut Core,
        context: ContextId,
        callback: F,
        log: &logging::Logger,
    ) -> EventId {
        let ts = if core.waiting_for_permission {
            core.barrier_ts
        } else {
            core.barrier_ts.saturating_sub(1)
        };

        logging::trace!(log, "scheduling into current slice";
                        "ts" => ts,
                        "barrier_ts" => core.barrier_ts,
                        "waiting" => core.waiting_for_permission);

        core.insert(ts, context, callback)
    }

    /// Queues `callback` for invocation at teardown.
    pub fn schedule_destroy<F: FnOnce() + Send + 'static>(&self, callback: F) -> EventId {
        let mut core = self.lock();

        let state = Arc::new(EventState::default());
        let key = EventKey {
            ts: core.current_ts,
            uid: UID_DESTROY,
        };
        core.destroy.push(DestroyEvent {
            state: state.clone(),
            callback: Box::new(callback),
        });
        core.alloc_uid();

        EventId::new(key, CONTEXT_NONE, state)
    }

    /// Lazily cancels an event: it stays queued but is skipped on dequeue.
    #[inline]
    pub fn cancel(&self, id: &EventId) {
        id.state().cancel();
    }

    /// Excises an event from the queue immediately.
    pub fn remove(&self, id: &EventId) {
        if id.uid() == UID_DESTROY {
            let mut core = self.lock();
            core.destroy
                .retain(|event| !Arc::ptr_eq(&event.state, id.state()));
            id.state().cancel();
            return;
        }

        if self.is_expired(id) {
            return;
        }

        let mut core = self.lock();
        core.queue.remove(&id.key());
        id.state().cancel();
    }

    /// True once the event has run, been cancelled, or been removed.
    pub fn is_expired(&self, id: &EventId) -> bool {
        if id.state().is_cancelled() {
            return true;
        }

        let core = self.lock();

        if id.uid() == UID_DESTROY {
            return !core
                .destroy
                .iter()
                .any(|event| Arc::ptr_eq(&event.state, id.state()));
        }

        id.ts() < core.current_ts || (id.ts() == core.current_ts && id.uid() <= core.current_uid)
    }

    /// Requests loop termination; checked at the top of the run loop.
    pub fn stop(&self) {
        self.lock().stop = true;
    }

    /// Schedules a stop at the given absolute virtual time.
    pub fn stop_at(&self, ts: Timestamp) -> EventId {
        let weak: Weak<Mutex<Core>> = Arc::downgrade(&self.core);
        let mut core = self.lock();

        core.insert(ts, CONTEXT_NONE, move || {
            if let Some(core) = weak.upgrade() {
                core.lock().expect("scheduler mutex poisoned").stop = true;
            }
        })
    }

    /// Number of events waiting in the queue.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    #[cfg(test)]
    pub(crate) fn barrier_ts(&self) -> Timestamp {
        self.lock().barrier_ts
    }

    #[cfg(test)]
    pub(crate) fn force_waiting(&self, waiting: bool) {
        self.lock().waiting_for_permission = waiting;
    }

    #[cfg(test)]
    pub(crate) fn force_barrier(&self, barrier_ts: Timestamp) {
        self.lock().barrier_ts = barrier_ts;
    }
}

/// The barrier-driven event loop.
pub struct SyncScheduler<L: SyncLink> {
    core: Arc<Mutex<Core>>,
    link: L,
    first_round: bool,
    last_run_time: u32,
    slice_started: Instant,
    log: logging::Logger,
}

impl<L: SyncLink> SyncScheduler<L> {
    pub fn new<'a, G: Into<Option<&'a logging::Logger>>>(link: L, log: G) -> SyncScheduler<L> {
        let scheduler_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::null(),
        };

        SyncScheduler {
            core: Arc::new(Mutex::new(Core::new())),
            link,
            first_round: true,
            last_run_time: 0,
            slice_started: Instant::now(),
            log: scheduler_log,
        }
    }

    /// A cloneable handle for scheduling operations.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            core: self.core.clone(),
            log: self.log.clone(),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<Core> {
        self.core.lock().expect("scheduler mutex poisoned")
    }

    /// Runs the simulation to completion: registers at the coordinator,
    /// executes events slice by slice, invokes destroy events and
    /// unregisters. Returns when the queue drains or `stop` is requested.
    pub fn run(&mut self) -> Result<()> {
        logging::info!(self.log, "registering at coordinator");
        self.link.connect_and_register()?;

        {
            let mut core = self.lock();
            core.waiting_for_permission = true;
        }
        self.first_round = true;
        self.slice_started = Instant::now();

        loop {
            let done = {
                let core = self.lock();
                core.stop || core.queue.is_empty()
            };
            if done {
                break;
            }

            self.process_one_event()?;
        }

        logging::debug!(self.log, "event loop finished, running destroy events");
        self.run_destroy_events();

        logging::info!(self.log, "unregistering from coordinator");
        self.link.unregister_and_disconnect()?;

        Ok(())
    }

    /// Advances the barrier until the earliest event is inside the granted
    /// slice, then executes it.
    fn process_one_event(&mut self) -> Result<()> {
        // An ingress packet arriving during a wait may be stamped earlier
        // than the event this pass was planning to run, so the whole
        // decision restarts whenever one slips in.
        'restart: loop {
            self.lock().new_event_arrived = false;

            loop {
                let (ts_next, barrier_ts) = {
                    let core = self.lock();
                    match core.queue.peek_key() {
                        Some(key) => (key.ts, core.barrier_ts),
                        None => return Ok(()),
                    }
                };

                // The barrier is exclusive: an event at exactly barrier_ts
                // belongs to the next slice.
                if ts_next < barrier_ts {
                    break;
                }

                self.lock().waiting_for_permission = true;

                if self.first_round {
                    // The coordinator answers the register with a grant, so
                    // there is no slice to report yet.
                    logging::debug!(self.log, "first round, skipping finished report");
                    self.first_round = false;
                } else {
                    let real_time = elapsed_micros(self.slice_started);
                    logging::trace!(self.log, "slice exhausted, reporting finished";
                                    "run_time" => self.last_run_time,
                                    "real_time" => real_time);
                    self.link.send_finished(self.last_run_time, real_time)?;
                }

                let run_time = self.link.wait_for_run_permission()?;
                self.slice_started = Instant::now();
                self.last_run_time = run_time;

                let arrived = {
                    let mut core = self.lock();
                    core.barrier_ts += u64::from(run_time) * 1000;
                    logging::trace!(self.log, "run permission applied";
                                    "run_time" => run_time,
                                    "barrier_ts" => core.barrier_ts);
                    core.new_event_arrived
                };

                if arrived {
                    logging::debug!(self.log, "event arrived during wait, restarting decision");
                    continue 'restart;
                }
            }

            let (key, event) = {
                let mut core = self.lock();
                core.waiting_for_permission = false;

                let (key, event) = match core.queue.pop() {
                    Some(entry) => entry,
                    None => return Ok(()),
                };

                debug_assert!(key.ts >= core.current_ts, "event order violation");
                debug_assert!(key.ts < core.barrier_ts, "barrier violation");

                // Simulated time is frozen at this timestamp until the next
                // event executes.
                core.current_ts = key.ts;
                core.current_uid = key.uid;
                core.current_context = event.context;

                (key, event)
            };

            logging::trace!(self.log, "executing event";
                            "ts" => key.ts,
                            "uid" => key.uid,
                            "context" => event.context);

            // The event is disentangled from the queue; invoke it without
            // holding the mutex so callbacks can schedule freely.
            if !event.state.is_cancelled() {
                (event.callback)();
            }

            return Ok(());
        }
    }

    /// Invokes the destroy events in insertion order, skipping cancelled
    /// ones.
    fn run_destroy_events(&mut self) {
        let destroy = {
            let mut core = self.lock();
            std::mem::replace(&mut core.destroy, Vec::new())
        };

        for event in destroy {
            if !event.state.is_cancelled() {
                (event.callback)();
            }
        }
    }
}
