//! Multi-session orchestration: one thread per device, one shared
//! abort, one completion signal.
//!
//! Coordination state is deliberately split into separate primitives:
//! an atomic count of sessions still running, an atomic abort flag,
//! and a condvar that fires when the last session exits. Raising the
//! abort also raises every session's restart latch so sessions blocked
//! in capture unwind promptly.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{error, info};

use crate::session::{CaptureSession, SessionStats};
use crate::sink::{NotificationSink, RestartReason};

/// Shared coordination state for one validation run.
pub struct RunGroup {
    remaining: AtomicUsize,
    aborted: AtomicBool,
    sinks: Mutex<Vec<Arc<NotificationSink>>>,
    done: Mutex<bool>,
    done_cond: Condvar,
    completion_signals: AtomicU64,
}

impl RunGroup {
    /// Group expecting `sessions` tasks; the count is pre-loaded so a
    /// fast-exiting session cannot signal completion before the rest
    /// have even started.
    pub fn new(sessions: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(sessions),
            aborted: AtomicBool::new(false),
            sinks: Mutex::new(Vec::new()),
            done: Mutex::new(sessions == 0),
            done_cond: Condvar::new(),
            completion_signals: AtomicU64::new(0),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Register a session's sink so `raise_abort` can reach its latch.
    pub fn register(&self, sink: Arc<NotificationSink>) {
        self.sinks.lock().expect("sink list poisoned").push(sink);
    }

    /// Flip the run into the aborted state and kick every session out
    /// of its capture wait. Only the first caller does anything.
    pub fn raise_abort(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("GLOBAL ABORT: corruption detected, unwinding all capture sessions");
        for sink in self.sinks.lock().expect("sink list poisoned").iter() {
            sink.latch().raise(RestartReason::Abort);
        }
    }

    /// Called exactly once per session, after its loop exits. The
    /// decrement that reaches zero signals completion.
    pub fn session_finished(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.completion_signals.fetch_add(1, Ordering::SeqCst);
            let mut done = self.done.lock().expect("done mutex poisoned");
            *done = true;
            self.done_cond.notify_all();
        }
    }

    /// Block until the last session has exited. No timeout; the only
    /// cancellation mechanism is the abort itself.
    pub fn wait_done(&self) {
        let mut done = self.done.lock().expect("done mutex poisoned");
        while !*done {
            done = self.done_cond.wait(done).expect("done mutex poisoned");
        }
    }

    /// How many times completion was signaled; 1 after any finished
    /// run, kept as a diagnostic for the convergence contract.
    pub fn completion_signals(&self) -> u64 {
        self.completion_signals.load(Ordering::SeqCst)
    }
}

/// Final verdict of a validation run.
#[derive(Debug)]
pub struct RunReport {
    /// False iff the run ended through the global abort.
    pub passed: bool,
    pub stats: Vec<SessionStats>,
}

/// Owns the sessions and runs them to convergence.
pub struct Orchestrator {
    sessions: Vec<CaptureSession>,
    group: Arc<RunGroup>,
}

/// Decrements the running count when a session thread exits, even by
/// panic; a panicking session also drags the run into abort so the
/// others do not wait forever on a peer that is gone.
struct FinishGuard {
    group: Arc<RunGroup>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.group.raise_abort();
        }
        self.group.session_finished();
    }
}

impl Orchestrator {
    pub fn new(sessions: Vec<CaptureSession>) -> Self {
        let group = Arc::new(RunGroup::new(sessions.len()));
        for session in &sessions {
            group.register(Arc::clone(session.sink()));
        }
        Self { sessions, group }
    }

    pub fn group(&self) -> &Arc<RunGroup> {
        &self.group
    }

    /// Run every session on its own thread, wait for the last one to
    /// exit, and report the verdict.
    pub fn run(self) -> RunReport {
        let Self { sessions, group } = self;
        info!("launching {} capture session(s)", sessions.len());

        let mut handles = Vec::with_capacity(sessions.len());
        for mut session in sessions {
            let group = Arc::clone(&group);
            let handle = thread::Builder::new()
                .name(format!("capture-{}", session.index()))
                .spawn(move || {
                    let _guard = FinishGuard {
                        group: Arc::clone(&group),
                    };
                    session.run(&group)
                })
                .expect("failed to spawn session thread");
            handles.push(handle);
        }

        group.wait_done();

        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.join() {
                Ok(session_stats) => stats.push(session_stats),
                Err(_) => error!("a session thread panicked; see log above"),
            }
        }
        stats.sort_by_key(|s| s.index);

        let passed = !group.is_aborted();
        if passed {
            info!("validation run finished with no corruption detected");
        } else {
            error!("validation run FAILED");
        }
        RunReport { passed, stats }
    }
}
