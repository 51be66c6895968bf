//! Transactional multi-queue background work manager.
//!
//! Work is submitted against named queues, each backed by its own bounded or
//! unbounded pool of OS worker threads. The defining property is
//! transaction-gated submission: work scheduled `after_commit` is parked
//! until the calling thread's transaction commits, and cancelled before it
//! ever runs if the transaction rolls back.
//!
//! The manager keeps complete knowledge of every work instance across its
//! lifecycle (scheduled after commit, scheduled, running, completed,
//! suspended), exposes dedup scheduling policies, applies producer
//! backpressure on bounded queues without deadlocking re-entrant producers,
//! and runs a save-on-shutdown protocol for work that cooperatively
//! suspends.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use txwork::{Scheduling, WorkManager, WorkQueueDescriptor};
//!
//! # fn demo(work: Arc<dyn txwork::Work>) {
//! let manager = WorkManager::options()
//!     .register_queue(
//!         WorkQueueDescriptor::builder()
//!             .id("default")
//!             .capacity(64usize)
//!             .build()
//!             .expect("valid descriptor"),
//!     )
//!     .init();
//!
//! manager
//!     .schedule(work, Scheduling::Enqueue, true)
//!     .expect("work is freshly scheduled");
//! manager.await_completion(Duration::from_secs(5)).unwrap();
//! manager.shutdown(Duration::from_secs(1));
//! # }
//! ```

mod builder;
mod errors;
mod manager;
mod metrics;
mod pool;
mod queue;
mod transaction;

pub use builder::WorkManagerOptions;
pub use errors::{Result, WorkManagerError};
pub use manager::{Scheduling, WorkManager, DEFAULT_THREAD_PREFIX};
pub use metrics::{
    QueueMetrics, COMPLETED_COUNTER, QUEUE_LABEL, RUNNING_GAUGE, SCHEDULED_GAUGE,
    SCHEDULED_MAX_GAUGE, WORK_DURATION_HISTOGRAM,
};
pub use pool::{FoundWork, SuspendedWorkSaver, WorkPool, WorkStateFilter};
pub use transaction::{
    CompletionStatus, Synchronization, Transaction, TransactionError, TransactionManager,
};

pub use txwork_job::{Work, WorkLifecycle, WorkState};
pub use txwork_registry::{
    WorkQueueDescriptor, WorkQueueDescriptorBuilder, WorkQueueDescriptorRegistry,
    DEFAULT_MAX_THREADS, DEFAULT_QUEUE_ID,
};
