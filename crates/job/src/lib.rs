//! Work job contract: the state machine every background job exposes to the
//! work manager, and the `WorkLifecycle` cell implementors embed to get the
//! transition rules right.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

/// Lifecycle states of a work instance.
///
/// `Scheduled -> Running -> Completed` is the nominal path. `Canceled` is only
/// reachable from `Scheduled`; `Suspended` is reached either from `Scheduled`
/// (the job never started) or from `Running` through a cooperative
/// checkpoint. States never go back to `Scheduled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkState {
    /// Submitted and waiting to be dispatched.
    Scheduled,
    /// Currently executing on a pool worker thread.
    Running,
    /// Finished, successfully or not. Failures are recorded on the job.
    Completed,
    /// Paused in response to a shutdown-suspend request.
    Suspended,
    /// Removed before it ever ran.
    Canceled,
}

impl WorkState {
    fn as_u8(self) -> u8 {
        match self {
            WorkState::Scheduled => 0,
            WorkState::Running => 1,
            WorkState::Completed => 2,
            WorkState::Suspended => 3,
            WorkState::Canceled => 4,
        }
    }

    fn from_u8(value: u8) -> WorkState {
        match value {
            0 => WorkState::Scheduled,
            1 => WorkState::Running,
            2 => WorkState::Completed,
            3 => WorkState::Suspended,
            4 => WorkState::Canceled,
            _ => unreachable!("invalid work state discriminant: {value}"),
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Shared lifecycle cell for a work instance.
///
/// Jobs are shared between the submitting thread, the pool bookkeeping and a
/// worker thread, so every transition is a compare-and-swap on an atomic
/// state; losing a race leaves the state untouched.
#[derive(Debug, Default)]
pub struct WorkLifecycle {
    state: AtomicU8,
    suspend_requested: AtomicBool,
    failed: AtomicBool,
    failure: Mutex<Option<String>>,
    start_time_ms: AtomicI64,
    completion_time_ms: AtomicI64,
}

impl WorkLifecycle {
    /// A fresh lifecycle in the `Scheduled` state.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkState {
        WorkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: WorkState, to: WorkState) -> bool {
        self.state
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Dispatch hook: `Scheduled -> Running`, stamping the start time.
    ///
    /// Returns whether the transition happened; it does not when the job was
    /// suspended or canceled while still queued.
    pub fn before_run(&self) -> bool {
        let started = self.transition(WorkState::Scheduled, WorkState::Running);
        if started {
            self.start_time_ms.store(now_ms(), Ordering::Release);
        }
        started
    }

    /// Completion hook: stamps the completion time, records the failure when
    /// `ok` is false, and moves `Running -> Completed`. A job that suspended
    /// or was canceled keeps that state.
    pub fn after_run(&self, ok: bool) {
        if !ok {
            self.failed.store(true, Ordering::Release);
        }
        self.completion_time_ms.store(now_ms(), Ordering::Release);
        self.transition(WorkState::Running, WorkState::Completed);
    }

    /// Asks the job to suspend. A job that never started suspends
    /// immediately; a running job only gets the request flag raised and
    /// suspends at its next [`checkpoint`](Self::checkpoint).
    pub fn suspend(&self) {
        if self.transition(WorkState::Scheduled, WorkState::Suspended) {
            return;
        }
        if self.state() == WorkState::Running {
            self.suspend_requested.store(true, Ordering::Release);
        }
    }

    /// Whether a suspend request is pending.
    pub fn suspension_requested(&self) -> bool {
        self.suspend_requested.load(Ordering::Acquire)
    }

    /// Cooperative suspension point for long-running bodies.
    ///
    /// Returns `true` when the body must stop: a pending suspend request was
    /// honoured here, or the job was already suspended or canceled before it
    /// got to run.
    pub fn checkpoint(&self) -> bool {
        if self.suspend_requested.load(Ordering::Acquire) {
            self.transition(WorkState::Running, WorkState::Suspended);
        }
        matches!(self.state(), WorkState::Suspended | WorkState::Canceled)
    }

    /// Cancels a job that has not started yet: `Scheduled -> Canceled`.
    ///
    /// Advisory for anything past `Scheduled`; a running job learns of
    /// cancellation only by polling its state.
    pub fn set_canceled(&self) -> bool {
        self.transition(WorkState::Scheduled, WorkState::Canceled)
    }

    /// Records why the run failed. The pool calls this before
    /// [`after_run`](Self::after_run) with `ok == false`.
    pub fn record_failure(&self, message: impl Into<String>) {
        self.failed.store(true, Ordering::Release);
        *self.failure.lock() = Some(message.into());
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Wall-clock start of the run in epoch milliseconds, 0 until started.
    pub fn start_time_ms(&self) -> i64 {
        self.start_time_ms.load(Ordering::Acquire)
    }

    /// Wall-clock end of the run in epoch milliseconds, 0 until finished.
    pub fn completion_time_ms(&self) -> i64 {
        self.completion_time_ms.load(Ordering::Acquire)
    }
}

/// A unit of background work.
///
/// Implementors provide identity, the run body and optionally a category,
/// priority, dedup equality and a serializable snapshot; the lifecycle
/// methods are provided by delegation to the embedded [`WorkLifecycle`].
///
/// Two distinct instances may be "the same job" for scheduling purposes
/// (see [`matches`](Self::matches)); the pool additionally tracks instances
/// by pointer identity, which is never affected by `matches`.
pub trait Work: Send + Sync + 'static {
    /// Stable identifier, also the default dedup key.
    fn work_id(&self) -> &str;

    /// The lifecycle cell backing the provided state methods.
    fn lifecycle(&self) -> &WorkLifecycle;

    /// The job body. An `Err` is recorded on the job as a failure; the job
    /// still completes for bookkeeping purposes. Long-running bodies should
    /// poll [`WorkLifecycle::checkpoint`] to honour suspend requests.
    fn run(&self) -> Result<(), String>;

    /// Category used to select the queue; unbound or absent categories fall
    /// through to the `default` queue.
    fn category(&self) -> Option<&str> {
        None
    }

    /// Ordering key for priority queues; lower values run first.
    fn priority(&self) -> i64 {
        0
    }

    /// Scheduling equality used by dedup policies and cancellation.
    fn matches(&self, other: &dyn Work) -> bool {
        self.work_id() == other.work_id()
    }

    /// Serializable state handed to the suspended-work saver on shutdown.
    fn data(&self) -> HashMap<String, Value> {
        HashMap::new()
    }

    fn state(&self) -> WorkState {
        self.lifecycle().state()
    }

    fn before_run(&self) {
        self.lifecycle().before_run();
    }

    fn after_run(&self, ok: bool) {
        self.lifecycle().after_run(ok);
    }

    fn suspend(&self) {
        self.lifecycle().suspend();
    }

    fn set_canceled(&self) {
        self.lifecycle().set_canceled();
    }

    fn start_time_ms(&self) -> i64 {
        self.lifecycle().start_time_ms()
    }

    fn completion_time_ms(&self) -> i64 {
        self.lifecycle().completion_time_ms()
    }
}

impl std::fmt::Debug for dyn Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Work").field("work_id", &self.work_id()).finish()
    }
}
