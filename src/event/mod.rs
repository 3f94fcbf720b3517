//! The cooperative scheduling engine.
//!
//! Everything in this crate runs single-threaded in the cooperative sense:
//! no operation yields in the middle of its execution, and anything that
//! would suspend instead schedules a deferred [`Call`] on the engine's
//! queue. Socket readers and timers living on tokio tasks never touch core
//! state directly; they marshal completions onto the same queue, so within
//! one call every observable mutation is atomic with respect to all other
//! calls.
//!
//! Long-lived state machines are [`Job`]s, addressed through weak
//! [`JobHandle`]s. A call dispatched through a dead handle is silently
//! cancelled, which is the only use-after-free defence the core needs.
//!
//! # Examples
//!
//! ```rust
//! use ikura::event::{Call, Engine};
//!
//! let engine = Engine::new();
//! engine.schedule(Call::new("hello", || println!("hi")));
//! engine.fire();
//! ```

mod job;
mod queue;

pub use job::{Job, JobCtx, JobHandle, start};
pub use queue::{Call, CallQueue};

use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A time source the tests can freeze and advance.
///
/// Wall time feeds `Age`/freshness math, the monotonic reading feeds the
/// DNS retransmit schedule. Both move together under [`Clock::advance`].
pub struct Clock {
    frozen: Mutex<Option<Frozen>>,
}

struct Frozen {
    wall: SystemTime,
    mono: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            frozen: Mutex::new(None),
        }
    }

    /// Current wall-clock time.
    pub fn now(&self) -> SystemTime {
        match &*self.frozen.lock() {
            Some(f) => f.wall,
            None => SystemTime::now(),
        }
    }

    /// Current monotonic time.
    pub fn mono(&self) -> Instant {
        match &*self.frozen.lock() {
            Some(f) => f.mono,
            None => Instant::now(),
        }
    }

    /// Stop the clock at the present moment. Time then only moves through
    /// [`Clock::advance`].
    pub fn freeze(&self) {
        *self.frozen.lock() = Some(Frozen {
            wall: SystemTime::now(),
            mono: Instant::now(),
        });
    }

    /// Move a frozen clock forward. No effect on a live clock.
    pub fn advance(&self, d: Duration) {
        if let Some(f) = &mut *self.frozen.lock() {
            f.wall += d;
            f.mono += d;
        }
    }
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    call: Call,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    // BinaryHeap is a max-heap; invert so the earliest deadline pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The process-wide dispatcher: one call queue, one timer heap, one job
/// registry, one clock.
pub struct Engine {
    queue: CallQueue,
    timers: Mutex<BinaryHeap<TimerEntry>>,
    jobs: Mutex<HashMap<u64, Box<dyn Any + Send>>>,
    seq: AtomicU64,
    clock: Clock,
    wakeup: Notify,
}

impl Engine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: CallQueue::new(),
            timers: Mutex::new(BinaryHeap::new()),
            jobs: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            clock: Clock::new(),
            wakeup: Notify::new(),
        })
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Shorthand for `clock().now()`.
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Append a call to the queue. It runs on the next drain, after every
    /// call scheduled before it.
    pub fn schedule(&self, call: Call) {
        self.queue.schedule(call);
        self.wakeup.notify_one();
    }

    /// Schedule a call to be queued once `delay` has elapsed.
    pub fn schedule_after(&self, delay: Duration, call: Call) {
        let entry = TimerEntry {
            at: self.clock.mono() + delay,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            call,
        };
        self.timers.lock().push(entry);
        self.wakeup.notify_one();
    }

    /// Drain the call queue. Returns whether at least one call was fired.
    pub fn fire(&self) -> bool {
        self.queue.fire()
    }

    /// Queue every timer whose deadline has passed, then drain the queue.
    pub fn tick(&self) -> bool {
        let mut expired = false;
        loop {
            let due = {
                let mut timers = self.timers.lock();
                match timers.peek() {
                    Some(t) if t.at <= self.clock.mono() => timers.pop(),
                    _ => None,
                }
            };
            match due {
                Some(t) => {
                    expired = true;
                    self.queue.schedule(t.call);
                }
                None => break,
            }
        }
        self.fire() || expired
    }

    /// Tick until neither the queue nor the due timers have work left.
    /// Timers in the future stay pending; advance the clock to reach them.
    pub fn run_until_idle(&self) {
        while self.tick() {}
    }

    /// Deadline of the nearest pending timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.lock().peek().map(|t| t.at)
    }

    /// Drive the engine under tokio until the far end drops it. Socket
    /// tasks call [`Engine::schedule`] and the notify wakes this loop.
    pub async fn run(self: &Arc<Self>) {
        loop {
            self.tick();
            match self.next_deadline() {
                Some(at) => {
                    let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(at.into()));
                    tokio::select! {
                        _ = sleep => {}
                        _ = self.wakeup.notified() => {}
                    }
                }
                None => self.wakeup.notified().await,
            }
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    pub(crate) fn add_job(&self, id: u64, cell: Box<dyn Any + Send>) {
        self.jobs.lock().insert(id, cell);
    }

    pub(crate) fn remove_job(&self, id: u64) {
        self.jobs.lock().remove(&id);
    }

    /// Number of live jobs, for diagnostics and tests.
    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }
}
