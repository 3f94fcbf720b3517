//! Long-lived jobs and their weak-handle dispatch.
//!
//! A job owns a small state machine. External holders keep a [`JobHandle`]
//! that loses validity when the job is destroyed; dispatching through a
//! dead handle silently cancels the call. Destruction happens in exactly
//! one place: the end of a call whose job reports `done()`, after the
//! `swan_song` cleanup hook has run.

use std::sync::{Arc, Weak};

use anyhow::Result;
use parking_lot::Mutex;

use super::{Call, Engine};

/// A long-lived owner of a state machine, driven only through scheduled
/// calls.
pub trait Job: Send + Sized + 'static {
    /// Type tag used in tracing output.
    fn type_name(&self) -> &'static str;

    /// First call delivered after [`start`] schedules the job.
    fn start(&mut self, ctx: &mut JobCtx<'_, Self>) -> Result<()>;

    /// True when the job has nothing further to do. Combined with the
    /// stop reason to form `done()`.
    fn done_all(&self) -> bool {
        true
    }

    /// Terminal cleanup hook, invoked exactly once, right before the job
    /// is dropped.
    fn swan_song(&mut self) {}
}

struct JobCore<J: Job> {
    job: J,
    in_call: Option<&'static str>,
    stop_reason: Option<&'static str>,
}

/// Registry cell holding the job state. The engine owns the strong
/// reference; every external pointer is weak.
pub struct JobCell<J: Job> {
    core: Mutex<JobCore<J>>,
}

/// Weak reference to a job. Cloneable; survives the job only as a dead
/// address.
pub struct JobHandle<J: Job> {
    id: u64,
    cell: Weak<JobCell<J>>,
    engine: Arc<Engine>,
}

impl<J: Job> Clone for JobHandle<J> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: self.cell.clone(),
            engine: self.engine.clone(),
        }
    }
}

/// Per-call context handed to the dialed method. Holds the job's own
/// handle for scheduling follow-up calls, and carries `must_stop`.
pub struct JobCtx<'a, J: Job> {
    handle: JobHandle<J>,
    stop: &'a mut Option<&'static str>,
}

impl<'a, J: Job> JobCtx<'a, J> {
    /// The job's own handle, for capturing into callbacks.
    pub fn handle(&self) -> JobHandle<J> {
        self.handle.clone()
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.handle.engine.clone()
    }

    /// Record the first stop reason and defer destruction to the end of
    /// the current call.
    pub fn must_stop(&mut self, reason: &'static str) {
        if let Some(first) = *self.stop {
            tracing::debug!(reason, first, "job will stop, another reason");
        } else {
            tracing::debug!(reason, "job will stop");
            *self.stop = Some(reason);
        }
    }

    pub fn stopping(&self) -> bool {
        self.stop.is_some()
    }
}

impl<J: Job> JobHandle<J> {
    /// True while the job still exists.
    pub fn alive(&self) -> bool {
        self.cell.strong_count() > 0
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Schedule a call into the job. The wrapper checks validity and
    /// reentrancy, delivers the call, and destroys the job afterwards if
    /// it reports done.
    pub fn call(
        &self,
        name: &'static str,
        f: impl FnOnce(&mut J, &mut JobCtx<'_, J>) -> Result<()> + Send + 'static,
    ) {
        let handle = self.clone();
        self.engine
            .schedule(Call::new(name, move || dispatch(handle, name, f)));
    }

    /// Externally-initiated teardown: fabricates a call so destruction
    /// still goes through the call-end bookkeeping.
    pub fn stop(&self, reason: &'static str) {
        self.call("Job::stop", move |_job, ctx| {
            ctx.must_stop(reason);
            Ok(())
        });
    }
}

fn dispatch<J: Job>(
    handle: JobHandle<J>,
    name: &'static str,
    f: impl FnOnce(&mut J, &mut JobCtx<'_, J>) -> Result<()>,
) {
    let Some(cell) = handle.cell.upgrade() else {
        tracing::trace!(call = name, "call cancelled, job gone");
        return;
    };

    let mut core = cell.core.lock();
    if let Some(active) = core.in_call {
        // see Job::call - a second dial while one is being delivered is a
        // caller bug, cancelled with a reason rather than delivered
        tracing::debug!(call = name, active, "cancelled: reentrant job call");
        return;
    }
    core.in_call = Some(name);

    let type_name = core.job.type_name();
    tracing::trace!(job = type_name, call = name, "status in");

    let mut stop = core.stop_reason.take();
    let JobCore { job, .. } = &mut *core;
    let mut ctx = JobCtx {
        handle: handle.clone(),
        stop: &mut stop,
    };
    if let Err(err) = f(job, &mut ctx) {
        tracing::warn!(job = type_name, call = name, %err, "call raised");
        if stop.is_none() {
            stop = Some("exception");
        }
    }
    core.stop_reason = stop;

    let done = core.stop_reason.is_some() || core.job.done_all();
    if done {
        tracing::trace!(
            job = type_name,
            call = name,
            reason = core.stop_reason.unwrap_or("doneAll"),
            "call ends job"
        );
        core.job.swan_song();
        core.in_call = None;
        drop(core);
        // the registry holds the only strong reference
        handle.engine.remove_job(handle.id);
    } else {
        core.in_call = None;
        tracing::trace!(job = type_name, call = name, "status out");
    }
}

/// Construct the job cell, register it, and schedule `start()` as the
/// first asynchronous call.
pub fn start<J: Job>(engine: &Arc<Engine>, job: J) -> JobHandle<J> {
    let id = engine.next_id();
    let cell = Arc::new(JobCell {
        core: Mutex::new(JobCore {
            job,
            in_call: None,
            stop_reason: None,
        }),
    });
    let handle = JobHandle {
        id,
        cell: Arc::downgrade(&cell),
        engine: engine.clone(),
    };
    engine.add_job(id, Box::new(cell));
    handle.call("Job::start", |job, ctx| job.start(ctx));
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        steps: usize,
        finished: bool,
        swansongs: Arc<AtomicUsize>,
    }

    impl Job for Counter {
        fn type_name(&self) -> &'static str {
            "Counter"
        }

        fn start(&mut self, ctx: &mut JobCtx<'_, Self>) -> Result<()> {
            self.steps += 1;
            ctx.handle().call("Counter::step", |job, _ctx| {
                job.steps += 1;
                job.finished = true;
                Ok(())
            });
            Ok(())
        }

        fn done_all(&self) -> bool {
            self.finished
        }

        fn swan_song(&mut self) {
            self.swansongs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn job_runs_to_completion_and_is_destroyed() {
        let engine = Engine::new();
        let swansongs = Arc::new(AtomicUsize::new(0));
        let handle = start(
            &engine,
            Counter {
                steps: 0,
                finished: false,
                swansongs: swansongs.clone(),
            },
        );

        assert!(handle.alive());
        engine.run_until_idle();
        assert!(!handle.alive());
        assert_eq!(engine.job_count(), 0);
        assert_eq!(swansongs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn call_through_dead_handle_is_cancelled_silently() {
        let engine = Engine::new();
        let handle = start(
            &engine,
            Counter {
                steps: 0,
                finished: true,
                swansongs: Arc::new(AtomicUsize::new(0)),
            },
        );
        engine.run_until_idle();
        assert!(!handle.alive());

        // must not panic or revive anything
        handle.call("Counter::late", |job, _| {
            job.steps += 100;
            Ok(())
        });
        engine.run_until_idle();
        assert_eq!(engine.job_count(), 0);
    }

    struct Faulty {
        swansongs: Arc<AtomicUsize>,
    }

    impl Job for Faulty {
        fn type_name(&self) -> &'static str {
            "Faulty"
        }

        fn start(&mut self, _ctx: &mut JobCtx<'_, Self>) -> Result<()> {
            anyhow::bail!("backing store went away")
        }

        fn done_all(&self) -> bool {
            false
        }

        fn swan_song(&mut self) {
            self.swansongs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn erroring_call_stops_the_job_at_call_end() {
        let engine = Engine::new();
        let swansongs = Arc::new(AtomicUsize::new(0));
        let handle = start(
            &engine,
            Faulty {
                swansongs: swansongs.clone(),
            },
        );
        engine.run_until_idle();
        // done_all() is false, so only the exception policy can have
        // ended the job
        assert!(!handle.alive());
        assert_eq!(swansongs.load(Ordering::SeqCst), 1);
    }

    struct Idle {
        swansongs: Arc<AtomicUsize>,
    }

    impl Job for Idle {
        fn type_name(&self) -> &'static str {
            "Idle"
        }

        fn start(&mut self, _ctx: &mut JobCtx<'_, Self>) -> Result<()> {
            Ok(())
        }

        fn done_all(&self) -> bool {
            false
        }

        fn swan_song(&mut self) {
            self.swansongs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn stop_goes_through_call_end() {
        let engine = Engine::new();
        let swansongs = Arc::new(AtomicUsize::new(0));
        let handle = start(
            &engine,
            Idle {
                swansongs: swansongs.clone(),
            },
        );
        engine.run_until_idle();
        assert!(handle.alive());

        handle.stop("test teardown");
        engine.run_until_idle();
        assert!(!handle.alive());
        assert_eq!(swansongs.load(Ordering::SeqCst), 1);
    }
}
