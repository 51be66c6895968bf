//! The work manager facade: queue lookup, scheduling policies, lifecycle
//! introspection and the shutdown protocol across all pools.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use txwork_job::{Work, WorkState};
use txwork_registry::{WorkQueueDescriptor, WorkQueueDescriptorRegistry, DEFAULT_QUEUE_ID};

use crate::builder::WorkManagerOptions;
use crate::errors::{Result, WorkManagerError};
use crate::metrics::QueueMetrics;
use crate::pool::{FoundWork, SuspendedWorkSaver, WorkPool, WorkStateFilter};
use crate::transaction::TransactionManager;

/// Default prefix of worker thread names. The prefix identifies re-entrant
/// producers, so anything submitting from a thread whose name starts with
/// it bypasses the bounded queue's rate limit.
pub const DEFAULT_THREAD_PREFIX: &str = "txwork-";

/// How often awaiting completion re-checks the queue sizes.
const AWAIT_POLL: Duration = Duration::from_millis(50);

/// Grace period deactivation grants in-flight work.
const DEACTIVATE_TIMEOUT: Duration = Duration::from_secs(1);

/// Policy applied when scheduling work that may already be known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// Always enqueue.
    Enqueue,
    /// Cancel equal scheduled instances first, then enqueue.
    CancelScheduled,
    /// Cancel the new instance if an equal one is already scheduled.
    IfNotScheduled,
    /// Cancel the new instance if an equal one is currently running.
    IfNotRunning,
    /// Cancel the new instance if an equal one is running or scheduled.
    IfNotRunningOrScheduled,
}

impl Scheduling {
    /// The state filter the dedup policies probe; `None` is the
    /// non-completed set.
    fn dedup_filter(self) -> Option<WorkStateFilter> {
        match self {
            Scheduling::IfNotScheduled => Some(WorkStateFilter::Scheduled),
            Scheduling::IfNotRunning => Some(WorkStateFilter::Running),
            _ => None,
        }
    }
}

/// Multi-queue, multi-pool background work executor with
/// transaction-gated submission.
///
/// An explicit value owning its descriptor registry and pools: construct it
/// through [`WorkManager::options`] at startup, pass the handle around, and
/// release it with [`shutdown`](Self::shutdown). Pools are created lazily on
/// first reference to their queue.
pub struct WorkManager {
    registry: RwLock<WorkQueueDescriptorRegistry>,
    /// `None` once the manager has been shut down; every later call fails.
    executors: Mutex<Option<HashMap<String, Arc<WorkPool>>>>,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    saver: Option<Arc<dyn SuspendedWorkSaver>>,
    thread_prefix: String,
}

impl WorkManager {
    /// Starts building a work manager.
    pub fn options() -> WorkManagerOptions {
        WorkManagerOptions::default()
    }

    pub(crate) fn new(
        thread_prefix: String,
        transaction_manager: Option<Arc<dyn TransactionManager>>,
        saver: Option<Arc<dyn SuspendedWorkSaver>>,
    ) -> Self {
        Self {
            registry: RwLock::new(WorkQueueDescriptorRegistry::new()),
            executors: Mutex::new(None),
            transaction_manager,
            saver,
            thread_prefix,
        }
    }

    /// The worker thread-name prefix, consultable for the re-entrant
    /// bypass.
    pub fn thread_prefix(&self) -> &str {
        &self.thread_prefix
    }

    /// Makes the manager operational (fresh, empty pool map). Called by the
    /// options builder; calling it on a shut-down manager revives it.
    pub fn activate(&self) {
        *self.executors.lock() = Some(HashMap::new());
    }

    /// Shuts the manager down with a short grace period for in-flight work.
    pub fn deactivate(&self) {
        self.shutdown(DEACTIVATE_TIMEOUT);
    }

    /// Registers a queue descriptor contribution.
    pub fn register_contribution(&self, descriptor: WorkQueueDescriptor) {
        self.registry.write().add_contribution(descriptor);
    }

    /// Unregisters a queue descriptor contribution.
    pub fn unregister_contribution(&self, queue_id: &str) {
        self.registry.write().remove_contribution(queue_id);
    }

    /// Ids of all registered queues.
    pub fn queue_ids(&self) -> Vec<String> {
        self.registry.read().queue_ids()
    }

    /// The descriptor registered for a queue, if any.
    pub fn queue_descriptor(&self, queue_id: &str) -> Option<WorkQueueDescriptor> {
        self.registry.read().descriptor(queue_id).cloned()
    }

    /// Resolves a category to its queue id (explicit binding, then the
    /// default queue).
    pub fn queue_id_for_category(&self, category: Option<&str>) -> Option<String> {
        self.registry
            .read()
            .queue_id_for_category(category)
            .map(str::to_string)
    }

    /// Create-or-get the pool for a queue, atomically.
    fn executor(&self, queue_id: &str) -> Result<Arc<WorkPool>> {
        let registry = self.registry.read();
        let descriptor = registry
            .descriptor(queue_id)
            .ok_or_else(|| WorkManagerError::UnknownQueue(queue_id.to_string()))?;

        let mut guard = self.executors.lock();
        let executors = guard.as_mut().ok_or(WorkManagerError::ShutDown)?;
        if let Some(pool) = executors.get(queue_id) {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(WorkPool::new(
            descriptor,
            &self.thread_prefix,
            self.transaction_manager.clone(),
            self.saver.clone(),
        ));
        executors.insert(queue_id.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Schedules work on the queue its category selects.
    ///
    /// The work must be freshly `Scheduled`. Dedup policies that find an
    /// equal instance mark the new one `Canceled` and return without
    /// enqueueing. With `after_commit`, enqueueing is deferred to the
    /// calling thread's transaction commit (and the work is cancelled on
    /// rollback); without an active transaction this degrades to an
    /// immediate enqueue. May block on a full bounded queue.
    pub fn schedule(
        &self,
        work: Arc<dyn Work>,
        scheduling: Scheduling,
        after_commit: bool,
    ) -> Result<()> {
        let state = work.state();
        if state != WorkState::Scheduled {
            return Err(WorkManagerError::InvalidState {
                expected: WorkState::Scheduled,
                actual: state,
            });
        }

        let queue_id = self.resolve_category(work.category())?;
        debug!(
            work_id = %work.work_id(),
            queue_id = %queue_id,
            ?scheduling,
            after_commit,
            "scheduling work"
        );
        let executor = self.executor(&queue_id)?;

        match scheduling {
            Scheduling::Enqueue => {}
            Scheduling::CancelScheduled => {
                executor.cancel_scheduled(work.as_ref());
            }
            Scheduling::IfNotScheduled
            | Scheduling::IfNotRunning
            | Scheduling::IfNotRunningOrScheduled => {
                if executor
                    .find(work.as_ref(), scheduling.dedup_filter(), true)
                    .is_some()
                {
                    work.set_canceled();
                    return Ok(());
                }
            }
        }

        executor.execute(work, after_commit);
        Ok(())
    }

    fn resolve_category(&self, category: Option<&str>) -> Result<String> {
        self.queue_id_for_category(category).ok_or_else(|| {
            WorkManagerError::UnboundCategory(
                category.unwrap_or(DEFAULT_QUEUE_ID).to_string(),
            )
        })
    }

    /// Finds a work instance on the queue its category selects, by equality
    /// or identity.
    pub fn find(
        &self,
        work: &dyn Work,
        filter: Option<WorkStateFilter>,
        use_equals: bool,
    ) -> Result<Option<FoundWork>> {
        let queue_id = self.resolve_category(work.category())?;
        Ok(self.executor(&queue_id)?.find(work, filter, use_equals))
    }

    /// Snapshot of a queue's work in the given state; `None` selects the
    /// non-completed set.
    pub fn list_work(
        &self,
        queue_id: &str,
        filter: Option<WorkStateFilter>,
    ) -> Result<Vec<Arc<dyn Work>>> {
        let executor = self.executor(queue_id)?;
        Ok(match filter {
            None => executor.non_completed_work(),
            Some(WorkStateFilter::Scheduled) => executor.scheduled_work(),
            Some(WorkStateFilter::Running) => executor.running_work(),
            Some(WorkStateFilter::Completed) => executor.completed_work(),
        })
    }

    /// Number of scheduled, awaiting-commit and running work instances on a
    /// queue.
    pub fn non_completed_work_size(&self, queue_id: &str) -> Result<usize> {
        Ok(self.executor(queue_id)?.non_completed_work_size())
    }

    /// Current counter values for a queue.
    pub fn queue_metrics(&self, queue_id: &str) -> Result<QueueMetrics> {
        Ok(self.executor(queue_id)?.metrics())
    }

    /// Waits until one queue has no non-completed work, polling every 50 ms.
    /// `false` means the deadline elapsed with work still pending.
    pub fn await_queue_completion(&self, queue_id: &str, timeout: Duration) -> Result<bool> {
        self.await_queues(&[queue_id.to_string()], timeout)
    }

    /// Waits until every registered queue has no non-completed work.
    pub fn await_completion(&self, timeout: Duration) -> Result<bool> {
        self.await_queues(&self.queue_ids(), timeout)
    }

    fn await_queues(&self, queue_ids: &[String], timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut completed = true;
            for queue_id in queue_ids {
                if self.non_completed_work_size(queue_id)? != 0 {
                    completed = false;
                    break;
                }
            }
            if completed {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(AWAIT_POLL);
        }
    }

    /// Drops a queue's completed work.
    pub fn clear_completed_work(&self, queue_id: &str) -> Result<()> {
        self.executor(queue_id)?.clear_completed();
        Ok(())
    }

    /// Drops, on every live pool, completed work whose completion time is
    /// before the cutoff (epoch milliseconds).
    pub fn clear_completed_work_before(&self, completion_time_ms: i64) -> Result<()> {
        let guard = self.executors.lock();
        let executors = guard.as_ref().ok_or(WorkManagerError::ShutDown)?;
        for pool in executors.values() {
            pool.clear_completed_before(completion_time_ms);
        }
        Ok(())
    }

    /// Applies each descriptor's completed-work retention.
    pub fn cleanup(&self) -> Result<()> {
        debug!("clearing old completed work");
        let pools: Vec<Arc<WorkPool>> = {
            let guard = self.executors.lock();
            let executors = guard.as_ref().ok_or(WorkManagerError::ShutDown)?;
            executors.values().cloned().collect()
        };
        let now_ms = Utc::now().timestamp_millis();
        for pool in pools {
            let retention_secs = {
                let registry = self.registry.read();
                registry
                    .descriptor(pool.queue_id())
                    .map(WorkQueueDescriptor::clear_completed_after_secs)
                    .unwrap_or(0)
            };
            if retention_secs > 0 {
                pool.clear_completed_before(now_ms - (retention_secs as i64) * 1000);
            }
        }
        Ok(())
    }

    /// Runs the shutdown protocol on one queue's pool and forgets it, so
    /// the next reference starts afresh.
    pub fn shutdown_queue(&self, queue_id: &str, timeout: Duration) -> Result<bool> {
        let executor = self.executor(queue_id)?;
        let terminated = shutdown_pools(&[executor], timeout);
        if let Some(executors) = self.executors.lock().as_mut() {
            executors.remove(queue_id);
        }
        Ok(terminated)
    }

    /// Shuts every pool down and drops the pool map; afterwards every
    /// operation fails with [`WorkManagerError::ShutDown`]. Returns whether
    /// all pools terminated within the deadline.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let pools: Vec<Arc<WorkPool>> = {
            let mut guard = self.executors.lock();
            match guard.take() {
                Some(executors) => executors.into_values().collect(),
                None => return true,
            }
        };
        shutdown_pools(&pools, timeout)
    }
}

impl Drop for WorkManager {
    fn drop(&mut self) {
        // Stop the worker threads if the owner never shut the manager down.
        self.shutdown(Duration::ZERO);
    }
}

fn shutdown_pools(pools: &[Arc<WorkPool>], timeout: Duration) -> bool {
    for pool in pools {
        pool.shutdown_and_suspend();
    }

    let deadline = Instant::now() + timeout;
    let mut terminated = true;
    for pool in pools {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !pool.await_termination_or_save(remaining) {
            terminated = false;
        }
    }
    terminated
}
