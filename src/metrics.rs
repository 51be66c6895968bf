//! Per-queue scheduling metrics: gauges for the live scheduled/running
//! sizes, the scheduled high-water mark, a completion counter and the
//! work-duration histogram, all labelled with the queue id.
//!
//! Atomic mirrors of the gauge values feed the scheduling logic itself
//! (high-water bumps, snapshots for introspection and tests); the `metrics`
//! facade gets updated alongside.

use std::sync::atomic::{AtomicI64, Ordering};

use getset::CopyGetters;
use metrics::{counter, gauge, histogram};

/// Gauge tracking the current scheduled size (queued + awaiting commit).
pub const SCHEDULED_GAUGE: &str = "work.scheduled";

/// Gauge tracking the scheduled high-water mark.
pub const SCHEDULED_MAX_GAUGE: &str = "work.scheduled.max";

/// Gauge tracking the number of currently running work instances.
pub const RUNNING_GAUGE: &str = "work.running";

/// Monotonic counter of completed work instances.
pub const COMPLETED_COUNTER: &str = "work.completed";

/// Histogram of per-work wall-clock durations, in seconds.
pub const WORK_DURATION_HISTOGRAM: &str = "work.duration.seconds";

/// Label carrying the queue id on every metric above.
pub const QUEUE_LABEL: &str = "queue";

/// Point-in-time view of one queue's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct QueueMetrics {
    scheduled: i64,
    scheduled_max: i64,
    running: i64,
    completed: i64,
}

#[derive(Debug)]
pub(crate) struct PoolMetrics {
    queue_id: String,
    scheduled: AtomicI64,
    scheduled_max: AtomicI64,
    running: AtomicI64,
    completed: AtomicI64,
}

impl PoolMetrics {
    pub fn new(queue_id: &str) -> Self {
        Self {
            queue_id: queue_id.to_string(),
            scheduled: AtomicI64::new(0),
            scheduled_max: AtomicI64::new(0),
            running: AtomicI64::new(0),
            completed: AtomicI64::new(0),
        }
    }

    /// Submission: bump the scheduled size and, if exceeded, the high-water
    /// mark.
    pub fn work_scheduled(&self) {
        let scheduled = self.scheduled.fetch_add(1, Ordering::AcqRel) + 1;
        gauge!(SCHEDULED_GAUGE, QUEUE_LABEL => self.queue_id.clone()).set(scheduled as f64);

        let mut max = self.scheduled_max.load(Ordering::Acquire);
        while scheduled > max {
            match self.scheduled_max.compare_exchange(
                max,
                scheduled,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    gauge!(SCHEDULED_MAX_GAUGE, QUEUE_LABEL => self.queue_id.clone())
                        .set(scheduled as f64);
                    break;
                }
                Err(current) => max = current,
            }
        }
    }

    /// A scheduled work left the scheduled set without being dispatched
    /// (cancellation, rollback, suspend-from-queue).
    pub fn work_unscheduled(&self) {
        let scheduled = self.scheduled.fetch_sub(1, Ordering::AcqRel) - 1;
        gauge!(SCHEDULED_GAUGE, QUEUE_LABEL => self.queue_id.clone()).set(scheduled as f64);
    }

    /// Dispatch: a scheduled work starts running. `was_scheduled` is false when the
    /// work had already left the scheduled set (cancelled in the dispatch
    /// race), in which case only the running gauge moves.
    pub fn work_started(&self, was_scheduled: bool) {
        if was_scheduled {
            let scheduled = self.scheduled.fetch_sub(1, Ordering::AcqRel) - 1;
            gauge!(SCHEDULED_GAUGE, QUEUE_LABEL => self.queue_id.clone()).set(scheduled as f64);
        }
        let running = self.running.fetch_add(1, Ordering::AcqRel) + 1;
        gauge!(RUNNING_GAUGE, QUEUE_LABEL => self.queue_id.clone()).set(running as f64);
    }

    /// The run finished, whatever the outcome.
    pub fn work_ended(&self) {
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        gauge!(RUNNING_GAUGE, QUEUE_LABEL => self.queue_id.clone()).set(running as f64);
    }

    /// The work landed in the completed list.
    pub fn work_completed(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
        counter!(COMPLETED_COUNTER, QUEUE_LABEL => self.queue_id.clone()).increment(1);
    }

    pub fn observe_duration_ms(&self, duration_ms: i64) {
        histogram!(WORK_DURATION_HISTOGRAM, QUEUE_LABEL => self.queue_id.clone())
            .record(duration_ms.max(0) as f64 / 1000.0);
    }

    pub fn snapshot(&self) -> QueueMetrics {
        QueueMetrics {
            scheduled: self.scheduled.load(Ordering::Acquire),
            scheduled_max: self.scheduled_max.load(Ordering::Acquire),
            running: self.running.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
        }
    }
}
