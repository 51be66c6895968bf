//! Options builder for [`WorkManager`].

use std::sync::Arc;

use txwork_registry::WorkQueueDescriptor;

use crate::manager::{WorkManager, DEFAULT_THREAD_PREFIX};
use crate::pool::SuspendedWorkSaver;
use crate::transaction::TransactionManager;

/// Configuration collected before a [`WorkManager`] is brought up.
///
/// ```no_run
/// use txwork::{WorkManager, WorkQueueDescriptor};
///
/// let manager = WorkManager::options()
///     .register_queue(
///         WorkQueueDescriptor::builder()
///             .id("default")
///             .max_threads(4usize)
///             .capacity(32usize)
///             .build()
///             .expect("valid descriptor"),
///     )
///     .init();
/// ```
#[derive(Default)]
pub struct WorkManagerOptions {
    thread_prefix: Option<String>,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    suspended_work_saver: Option<Arc<dyn SuspendedWorkSaver>>,
    queues: Vec<WorkQueueDescriptor>,
}

impl WorkManagerOptions {
    /// Builds and activates the manager, registering the queue
    /// contributions collected so far.
    pub fn init(self) -> WorkManager {
        let manager = WorkManager::new(
            self.thread_prefix
                .unwrap_or_else(|| DEFAULT_THREAD_PREFIX.to_string()),
            self.transaction_manager,
            self.suspended_work_saver,
        );
        manager.activate();
        for descriptor in self.queues {
            manager.register_contribution(descriptor);
        }
        manager
    }

    /// Worker thread-name prefix; also the marker the bounded queues use to
    /// recognise re-entrant producers.
    pub fn thread_prefix(mut self, value: &str) -> Self {
        self.thread_prefix = Some(value.to_string());
        self
    }

    /// Transaction engine consulted for after-commit submissions. Without
    /// one, `after_commit` always degrades to an immediate enqueue.
    pub fn transaction_manager(mut self, value: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = Some(value);
        self
    }

    /// Sink for the state of work suspended during shutdown.
    pub fn suspended_work_saver(mut self, value: Arc<dyn SuspendedWorkSaver>) -> Self {
        self.suspended_work_saver = Some(value);
        self
    }

    /// Registers a queue descriptor at startup.
    pub fn register_queue(mut self, descriptor: WorkQueueDescriptor) -> Self {
        self.queues.push(descriptor);
        self
    }
}
