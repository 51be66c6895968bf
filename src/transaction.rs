//! Transaction hooks consumed by after-commit scheduling.
//!
//! The transaction engine itself is external; the manager is handed a
//! [`TransactionManager`] and only registers completion callbacks against
//! the transaction active on the scheduling thread.

use std::sync::Arc;

use thiserror::Error;

/// Outcome reported to a [`Synchronization`] when its transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Committed,
    RolledBack,
    /// Any other termination the engine may report; scheduling callbacks
    /// log and drop it.
    Unknown,
}

/// Two-phase completion callback registered with a transaction.
pub trait Synchronization: Send + Sync {
    /// Invoked before the transaction completes. Scheduling does nothing
    /// here.
    fn before_completion(&self) {}

    /// Invoked once the transaction has committed or rolled back.
    fn after_completion(&self, status: CompletionStatus);
}

/// A transaction as seen by the work manager: liveness plus callback
/// registration.
pub trait Transaction: Send + Sync {
    fn is_active(&self) -> bool;

    fn register_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
    ) -> Result<(), TransactionError>;
}

/// Access to the transaction bound to the calling thread.
pub trait TransactionManager: Send + Sync {
    fn current_transaction(&self) -> Result<Option<Arc<dyn Transaction>>, TransactionError>;
}

/// Failures while talking to the transaction engine. Scheduling treats
/// every one of them as "no transaction" and enqueues immediately.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction lookup failed: {0}")]
    Lookup(String),

    #[error("synchronization registration failed: {0}")]
    Registration(String),
}
