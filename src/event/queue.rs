//! The deferred-call FIFO.
//!
//! A [`Call`] is a named, single-shot closure. The queue is drained only
//! from the engine tick, never recursively: a call scheduled while the
//! queue is draining lands at the tail and fires in the same drain.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// One deferred invocation. The name exists purely for tracing.
pub struct Call {
    name: &'static str,
    make: Box<dyn FnOnce() + Send>,
}

impl Call {
    pub fn new(name: &'static str, make: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name,
            make: Box::new(make),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn fire(self) {
        tracing::trace!(call = self.name, "entering");
        (self.make)();
        tracing::trace!(call = self.name, "leaving");
    }
}

/// FIFO of pending calls with the append-during-drain contract.
pub struct CallQueue {
    q: Mutex<VecDeque<Call>>,
}

impl CallQueue {
    pub fn new() -> Self {
        Self {
            q: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a call.
    pub fn schedule(&self, call: Call) {
        self.q.lock().push_back(call);
    }

    /// Fire all scheduled calls; returns whether at least one fired.
    /// Calls appended while draining fire in the same invocation. The
    /// lock is not held across a call, so a call may schedule freely.
    pub fn fire(&self) -> bool {
        let mut fired = false;
        loop {
            let next = self.q.lock().pop_front();
            match next {
                Some(call) => {
                    fired = true;
                    call.fire();
                }
                None => break,
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.q.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.lock().is_empty()
    }
}

impl Default for CallQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fire_reports_whether_anything_ran() {
        let q = CallQueue::new();
        assert!(!q.fire());
        q.schedule(Call::new("noop", || {}));
        assert!(q.fire());
        assert!(q.is_empty());
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = CallQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let log = log.clone();
            q.schedule(Call::new("step", move || log.lock().push(i)));
        }
        q.fire();
        assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn calls_scheduled_during_drain_fire_in_same_drain() {
        let q = Arc::new(CallQueue::new());
        let count = Arc::new(AtomicUsize::new(0));

        let q2 = q.clone();
        let c2 = count.clone();
        q.schedule(Call::new("outer", move || {
            c2.fetch_add(1, Ordering::SeqCst);
            let c3 = c2.clone();
            q2.schedule(Call::new("inner", move || {
                c3.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        assert!(q.fire());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(q.is_empty());
    }
}
