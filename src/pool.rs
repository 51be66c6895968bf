//! Per-queue work pool: a fixed set of named worker threads over a blocking
//! queue, with full knowledge of every work instance across its lifecycle.
//!
//! One monitor guards the five lifecycle lists (scheduled-after-commit,
//! scheduled, running, completed, suspended) and is never held while
//! blocking on the pool queue.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use tracing::{debug, error, warn};
use txwork_job::{Work, WorkState};
use txwork_registry::WorkQueueDescriptor;

use crate::metrics::{PoolMetrics, QueueMetrics};
use crate::queue::PoolQueue;
use crate::transaction::{CompletionStatus, Synchronization, TransactionManager};

/// How long an idle worker waits on the queue before re-checking shutdown.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// State filter for find/list operations, mapping onto the pool's
/// introspection lists. `None` in the APIs taking `Option<WorkStateFilter>`
/// selects the non-completed set (running, scheduled and
/// scheduled-after-commit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStateFilter {
    /// Queued or parked awaiting a transaction commit.
    Scheduled,
    /// Currently executing.
    Running,
    /// Finished (including failed runs).
    Completed,
}

/// Result of a find: the matching instance and its position in the first
/// list that contained it.
#[derive(Clone)]
pub struct FoundWork {
    pub work: Arc<dyn Work>,
    pub position: usize,
}

/// Sink for the serializable state of work suspended during shutdown.
///
/// The pool collects each still-suspended job's `data()` and hands it over;
/// persistence is entirely the implementor's business. A save failure is
/// logged and not retried.
pub trait SuspendedWorkSaver: Send + Sync {
    fn save(&self, work: &dyn Work, data: HashMap<String, Value>) -> Result<(), String>;
}

/// Identity comparison (same instance), as opposed to `Work::matches`.
fn same_instance(a: &dyn Work, b: &dyn Work) -> bool {
    std::ptr::eq(
        a as *const dyn Work as *const (),
        b as *const dyn Work as *const (),
    )
}

fn remove_by_identity(list: &mut Vec<Arc<dyn Work>>, target: &Arc<dyn Work>) -> bool {
    if let Some(index) = list
        .iter()
        .position(|work| same_instance(work.as_ref(), target.as_ref()))
    {
        list.remove(index);
        true
    } else {
        false
    }
}

/// Removes every entry equal to `target`, cancelling each; returns how many
/// were removed.
fn cancel_matching(list: &mut Vec<Arc<dyn Work>>, target: &dyn Work) -> usize {
    let before = list.len();
    list.retain(|work| {
        if work.matches(target) {
            work.set_canceled();
            false
        } else {
            true
        }
    });
    before - list.len()
}

#[derive(Default)]
struct WorkLists {
    scheduled_after_commit: Vec<Arc<dyn Work>>,
    scheduled: Vec<Arc<dyn Work>>,
    running: Vec<Arc<dyn Work>>,
    completed: Vec<Arc<dyn Work>>,
    suspended: Vec<Arc<dyn Work>>,
}

struct PoolShared {
    queue_id: String,
    queue: PoolQueue,
    lists: Mutex<WorkLists>,
    metrics: PoolMetrics,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    saver: Option<Arc<dyn SuspendedWorkSaver>>,
    /// No more external submits; late arrivals are diverted through the
    /// suspend policy while workers drain the queue and exit.
    shutdown: AtomicBool,
    /// Hard stop after the shutdown deadline; workers exit without draining.
    stop_now: AtomicBool,
    alive_workers: Mutex<usize>,
    termination: Condvar,
}

impl PoolShared {
    /// Hands work to the pool queue. Once the pool is shutting down the
    /// rejection policy is to suspend: the work is diverted into the
    /// suspended list instead of being lost. May block on a full bounded
    /// queue.
    fn submit(&self, work: Arc<dyn Work>) {
        if self.shutdown.load(Ordering::Acquire) {
            self.suspend_from_queue(work);
            return;
        }
        self.queue.offer(work);
    }

    /// Suspend policy for runnables that never reach a worker: asks the
    /// work to suspend and moves it to the suspended list.
    fn suspend_from_queue(&self, work: Arc<dyn Work>) {
        work.suspend();
        if work.state() != WorkState::Suspended {
            error!(
                queue_id = %self.queue_id,
                work_id = %work.work_id(),
                state = ?work.state(),
                "work failed to suspend while draining the queue"
            );
            return;
        }
        let mut lists = self.lists.lock();
        if remove_by_identity(&mut lists.scheduled, &work) {
            self.metrics.work_unscheduled();
        }
        lists.suspended.push(work);
    }

    fn before_execute(&self, work: &Arc<dyn Work>) {
        let mut lists = self.lists.lock();
        let was_scheduled = remove_by_identity(&mut lists.scheduled, work);
        lists.running.push(work.clone());
        work.before_run();
        self.metrics.work_started(was_scheduled);
    }

    fn after_execute(&self, work: &Arc<dyn Work>, ok: bool) {
        let mut lists = self.lists.lock();
        self.metrics.work_ended();
        work.after_run(ok);
        let start = work.start_time_ms();
        if start > 0 {
            self.metrics
                .observe_duration_ms(work.completion_time_ms() - start);
        }
        remove_by_identity(&mut lists.running, work);
        if work.state() == WorkState::Suspended {
            lists.suspended.push(work.clone());
        } else {
            lists.completed.push(work.clone());
            self.metrics.work_completed();
        }
    }

    /// Commit half of the after-commit callback: move the work from the
    /// parked list to the scheduled list and hand it to the queue. The work
    /// may legitimately be gone already (cancelled before the commit).
    fn commit_scheduled(&self, work: &Arc<dyn Work>) {
        let removed = {
            let mut lists = self.lists.lock();
            let removed = remove_by_identity(&mut lists.scheduled_after_commit, work);
            if removed {
                lists.scheduled.push(work.clone());
            }
            removed
        };
        if removed {
            self.submit(work.clone());
        }
    }

    /// Rollback half of the after-commit callback.
    fn cancel_scheduled_after_commit(&self, work: &Arc<dyn Work>) {
        let removed = {
            let mut lists = self.lists.lock();
            remove_by_identity(&mut lists.scheduled_after_commit, work)
        };
        if removed {
            self.metrics.work_unscheduled();
            work.set_canceled();
        }
    }

    /// Asks every non-completed work instance to suspend.
    fn suspend(&self) {
        let lists = self.lists.lock();
        for work in lists
            .running
            .iter()
            .chain(&lists.scheduled)
            .chain(&lists.scheduled_after_commit)
        {
            work.suspend();
        }
    }
}

/// Synchronization parking one work instance until its transaction ends.
struct WorkSchedulingSynchronization {
    work: Arc<dyn Work>,
    pool: Arc<PoolShared>,
}

impl Synchronization for WorkSchedulingSynchronization {
    fn after_completion(&self, status: CompletionStatus) {
        if self.work.state() != WorkState::Scheduled {
            // Already cancelled or suspended while parked.
            return;
        }
        match status {
            CompletionStatus::Committed => self.pool.commit_scheduled(&self.work),
            CompletionStatus::RolledBack => self.pool.cancel_scheduled_after_commit(&self.work),
            CompletionStatus::Unknown => error!(
                queue_id = %self.pool.queue_id,
                work_id = %self.work.work_id(),
                "unexpected transaction status after completion"
            ),
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        if shared.stop_now.load(Ordering::Acquire) {
            break;
        }
        let Some(work) = shared.queue.poll(IDLE_POLL) else {
            if shared.shutdown.load(Ordering::Acquire) && shared.queue.is_empty() {
                break;
            }
            continue;
        };

        shared.before_execute(&work);
        let outcome = catch_unwind(AssertUnwindSafe(|| work.run()));
        let ok = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(message)) => {
                warn!(
                    queue_id = %shared.queue_id,
                    work_id = %work.work_id(),
                    %message,
                    "work failed"
                );
                work.lifecycle().record_failure(message);
                false
            }
            Err(_) => {
                error!(
                    queue_id = %shared.queue_id,
                    work_id = %work.work_id(),
                    "work panicked during run"
                );
                work.lifecycle().record_failure("panic during run");
                false
            }
        };
        shared.after_execute(&work, ok);
    }

    let mut alive = shared.alive_workers.lock();
    *alive -= 1;
    shared.termination.notify_all();
}

/// The executor behind one queue.
pub struct WorkPool {
    shared: Arc<PoolShared>,
}

impl WorkPool {
    pub(crate) fn new(
        descriptor: &WorkQueueDescriptor,
        thread_prefix: &str,
        transaction_manager: Option<Arc<dyn TransactionManager>>,
        saver: Option<Arc<dyn SuspendedWorkSaver>>,
    ) -> Self {
        let queue_id = descriptor.id().clone();
        let max_threads = descriptor.effective_max_threads();
        let shared = Arc::new(PoolShared {
            queue_id: queue_id.clone(),
            queue: PoolQueue::for_descriptor(descriptor, thread_prefix),
            lists: Mutex::new(WorkLists::default()),
            metrics: PoolMetrics::new(&queue_id),
            transaction_manager,
            saver,
            shutdown: AtomicBool::new(false),
            stop_now: AtomicBool::new(false),
            alive_workers: Mutex::new(max_threads),
            termination: Condvar::new(),
        });

        debug!(queue_id = %queue_id, max_threads, "starting work pool");
        for n in 0..max_threads {
            let worker_shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{thread_prefix}{queue_id}-{n}"))
                .spawn(move || worker_loop(worker_shared))
                .expect("failed to spawn work pool thread");
        }

        Self { shared }
    }

    pub fn queue_id(&self) -> &str {
        &self.shared.queue_id
    }

    /// Submits work for execution.
    ///
    /// With `after_commit` and an ACTIVE transaction on the calling thread,
    /// the work is parked until the transaction completes; otherwise (no
    /// transaction, lookup failure, registration failure) it degrades to an
    /// immediate enqueue. May block on a full bounded queue.
    pub fn execute(&self, work: Arc<dyn Work>, after_commit: bool) {
        self.shared.metrics.work_scheduled();
        if after_commit && self.park_until_commit(&work) {
            return;
        }
        self.shared.lists.lock().scheduled.push(work.clone());
        self.shared.submit(work);
    }

    fn park_until_commit(&self, work: &Arc<dyn Work>) -> bool {
        let Some(transaction_manager) = &self.shared.transaction_manager else {
            return false;
        };
        let transaction = match transaction_manager.current_transaction() {
            Ok(Some(transaction)) if transaction.is_active() => transaction,
            Ok(_) => return false,
            Err(e) => {
                debug!(
                    queue_id = %self.shared.queue_id,
                    error = %e,
                    "transaction lookup failed, scheduling immediately"
                );
                return false;
            }
        };

        let synchronization = Arc::new(WorkSchedulingSynchronization {
            work: work.clone(),
            pool: Arc::clone(&self.shared),
        });
        if let Err(e) = transaction.register_synchronization(synchronization) {
            debug!(
                queue_id = %self.shared.queue_id,
                error = %e,
                "could not register synchronization, scheduling immediately"
            );
            return false;
        }

        self.shared
            .lists
            .lock()
            .scheduled_after_commit
            .push(work.clone());
        true
    }

    /// Finds a work instance in the lists selected by `filter`, searched in
    /// the order running, scheduled (queued or awaiting commit), completed.
    pub fn find(
        &self,
        target: &dyn Work,
        filter: Option<WorkStateFilter>,
        use_equals: bool,
    ) -> Option<FoundWork> {
        let lists = self.shared.lists.lock();
        let selected: Vec<&Vec<Arc<dyn Work>>> = match filter {
            None => vec![
                &lists.running,
                &lists.scheduled,
                &lists.scheduled_after_commit,
            ],
            Some(WorkStateFilter::Running) => vec![&lists.running],
            Some(WorkStateFilter::Scheduled) => {
                vec![&lists.scheduled, &lists.scheduled_after_commit]
            }
            Some(WorkStateFilter::Completed) => vec![&lists.completed],
        };
        for list in selected {
            for (position, work) in list.iter().enumerate() {
                let found = if use_equals {
                    work.matches(target)
                } else {
                    same_instance(work.as_ref(), target)
                };
                if found {
                    return Some(FoundWork {
                        work: work.clone(),
                        position,
                    });
                }
            }
        }
        None
    }

    /// Removes every instance equal to `target` from the pool queue and,
    /// if the queue gave anything up, cancels every equal entry in the
    /// scheduled lists. Returns whether anything was removed.
    pub fn cancel_scheduled(&self, target: &dyn Work) -> bool {
        let mut removed = false;
        while self.shared.queue.remove_matching(target) {
            removed = true;
        }
        if removed {
            let canceled = {
                let mut lists = self.shared.lists.lock();
                cancel_matching(&mut lists.scheduled_after_commit, target)
                    + cancel_matching(&mut lists.scheduled, target)
            };
            for _ in 0..canceled {
                self.shared.metrics.work_unscheduled();
            }
        }
        removed
    }

    /// Scheduled work: queued plus awaiting commit. Returns a copy.
    pub fn scheduled_work(&self) -> Vec<Arc<dyn Work>> {
        let lists = self.shared.lists.lock();
        lists
            .scheduled
            .iter()
            .chain(&lists.scheduled_after_commit)
            .cloned()
            .collect()
    }

    /// Running work. Returns a copy.
    pub fn running_work(&self) -> Vec<Arc<dyn Work>> {
        self.shared.lists.lock().running.clone()
    }

    /// Completed work. Returns a copy; grows until explicitly cleared.
    pub fn completed_work(&self) -> Vec<Arc<dyn Work>> {
        self.shared.lists.lock().completed.clone()
    }

    /// Everything not yet completed. Returns a copy.
    pub fn non_completed_work(&self) -> Vec<Arc<dyn Work>> {
        let lists = self.shared.lists.lock();
        lists
            .running
            .iter()
            .chain(&lists.scheduled)
            .chain(&lists.scheduled_after_commit)
            .cloned()
            .collect()
    }

    pub fn non_completed_work_size(&self) -> usize {
        let lists = self.shared.lists.lock();
        lists.scheduled.len() + lists.scheduled_after_commit.len() + lists.running.len()
    }

    pub fn clear_completed(&self) {
        self.shared.lists.lock().completed.clear();
    }

    /// Drops completed work whose completion time is before the cutoff
    /// (epoch milliseconds); a non-positive cutoff clears everything.
    pub fn clear_completed_before(&self, completion_time_ms: i64) {
        if completion_time_ms <= 0 {
            self.clear_completed();
            return;
        }
        self.shared
            .lists
            .lock()
            .completed
            .retain(|work| work.completion_time_ms() >= completion_time_ms);
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.shared.metrics.snapshot()
    }

    /// Initiates a shutdown: stops accepting external submits (late
    /// arrivals fall through to the suspend policy), and asks every
    /// non-completed work instance to suspend. Workers keep draining the
    /// queue.
    pub(crate) fn shutdown_and_suspend(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.queue.wake_all();
        self.shared.suspend();
    }

    /// Blocks until the workers have exited or the deadline elapses. On
    /// deadline, hard-stops the workers and drains the queue through the
    /// suspend policy. Either way the suspended list is then snapshotted,
    /// cleared and handed to the saver. Returns whether the pool terminated
    /// within the deadline.
    pub(crate) fn await_termination_or_save(&self, timeout: Duration) -> bool {
        let terminated = self.await_termination(timeout);
        if !terminated {
            self.shared.stop_now.store(true, Ordering::Release);
            self.shared.queue.wake_all();
            for work in self.shared.queue.drain() {
                self.shared.suspend_from_queue(work);
            }
        }

        let to_save = {
            let mut lists = self.shared.lists.lock();
            std::mem::take(&mut lists.suspended)
        };
        for work in to_save {
            if work.state() != WorkState::Suspended {
                error!(
                    queue_id = %self.shared.queue_id,
                    work_id = %work.work_id(),
                    state = ?work.state(),
                    "work in suspended list but not suspended"
                );
                continue;
            }
            let data = work.data();
            if let Some(saver) = &self.shared.saver {
                if let Err(message) = saver.save(work.as_ref(), data) {
                    error!(
                        queue_id = %self.shared.queue_id,
                        work_id = %work.work_id(),
                        %message,
                        "failed to save suspended work"
                    );
                }
            }
        }

        terminated
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut alive = self.shared.alive_workers.lock();
        while *alive > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            self.shared.termination.wait_until(&mut alive, deadline);
        }
        true
    }
}
