#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use txwork::{
    CompletionStatus, SuspendedWorkSaver, Synchronization, Transaction, TransactionError,
    TransactionManager, Work, WorkLifecycle, WorkQueueDescriptor,
};

/// Cooperative test job: optional sleep in 10 ms slices with suspension
/// checkpoints, optional failure, optional follow-up action, and a shared
/// run counter.
pub struct TestWork {
    id: String,
    category: Option<String>,
    lifecycle: WorkLifecycle,
    sleep: Duration,
    fail: bool,
    priority: i64,
    runs: Arc<AtomicUsize>,
    on_run: Option<Box<dyn Fn() + Send + Sync>>,
    data: HashMap<String, Value>,
}

impl TestWork {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            category: None,
            lifecycle: WorkLifecycle::new(),
            sleep: Duration::ZERO,
            fail: false,
            priority: 0,
            runs: Arc::new(AtomicUsize::new(0)),
            on_run: None,
            data: HashMap::new(),
        }
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn with_runs(mut self, runs: Arc<AtomicUsize>) -> Self {
        self.runs = runs;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn on_run(mut self, action: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_run = Some(Box::new(action));
        self
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn runs_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.runs)
    }
}

impl Work for TestWork {
    fn work_id(&self) -> &str {
        &self.id
    }

    fn lifecycle(&self) -> &WorkLifecycle {
        &self.lifecycle
    }

    fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    fn priority(&self) -> i64 {
        self.priority
    }

    fn data(&self) -> HashMap<String, Value> {
        self.data.clone()
    }

    fn run(&self) -> Result<(), String> {
        if self.lifecycle.checkpoint() {
            return Ok(());
        }
        self.runs.fetch_add(1, Ordering::SeqCst);

        let mut remaining = self.sleep;
        while remaining > Duration::ZERO {
            let slice = remaining.min(Duration::from_millis(10));
            std::thread::sleep(slice);
            remaining -= slice;
            if self.lifecycle.checkpoint() {
                return Ok(());
            }
        }

        if let Some(on_run) = &self.on_run {
            on_run();
        }
        if self.fail {
            return Err(format!("work {} failed on purpose", self.id));
        }
        Ok(())
    }
}

/// Single-transaction test engine: `begin` binds a transaction, `commit` /
/// `rollback` fire the registered synchronizations.
#[derive(Default)]
pub struct TestTransactionManager {
    current: Mutex<Option<Arc<TestTransaction>>>,
}

pub struct TestTransaction {
    active: AtomicBool,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
}

impl TestTransactionManager {
    pub fn begin(&self) -> Arc<TestTransaction> {
        let transaction = Arc::new(TestTransaction {
            active: AtomicBool::new(true),
            synchronizations: Mutex::new(Vec::new()),
        });
        *self.current.lock() = Some(Arc::clone(&transaction));
        transaction
    }

    pub fn commit(&self) {
        self.end(CompletionStatus::Committed);
    }

    pub fn rollback(&self) {
        self.end(CompletionStatus::RolledBack);
    }

    fn end(&self, status: CompletionStatus) {
        let Some(transaction) = self.current.lock().take() else {
            return;
        };
        transaction.active.store(false, Ordering::SeqCst);
        let synchronizations = std::mem::take(&mut *transaction.synchronizations.lock());
        for synchronization in &synchronizations {
            synchronization.before_completion();
        }
        for synchronization in &synchronizations {
            synchronization.after_completion(status);
        }
    }
}

impl TransactionManager for TestTransactionManager {
    fn current_transaction(&self) -> Result<Option<Arc<dyn Transaction>>, TransactionError> {
        Ok(self
            .current
            .lock()
            .clone()
            .map(|transaction| transaction as Arc<dyn Transaction>))
    }
}

impl Transaction for TestTransaction {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn register_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
    ) -> Result<(), TransactionError> {
        self.synchronizations.lock().push(synchronization);
        Ok(())
    }
}

/// Saver that records every suspended work id and data map it is handed.
#[derive(Default)]
pub struct RecordingSaver {
    saved: Mutex<Vec<(String, HashMap<String, Value>)>>,
}

impl RecordingSaver {
    pub fn saved_ids(&self) -> Vec<String> {
        self.saved.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn saved(&self) -> Vec<(String, HashMap<String, Value>)> {
        self.saved.lock().clone()
    }
}

impl SuspendedWorkSaver for RecordingSaver {
    fn save(&self, work: &dyn Work, data: HashMap<String, Value>) -> Result<(), String> {
        self.saved.lock().push((work.work_id().to_string(), data));
        Ok(())
    }
}

/// Builds a bounded FIFO queue descriptor.
pub fn queue(id: &str, max_threads: usize, capacity: usize) -> WorkQueueDescriptor {
    WorkQueueDescriptor::builder()
        .id(id)
        .max_threads(max_threads)
        .capacity(capacity)
        .build()
        .expect("descriptor should build")
}

/// Polls `condition` every 10 ms until it holds or the deadline elapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub fn enable_logs() {
    static ONCE: Once = Once::new();

    ONCE.call_once(|| {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        use tracing_subscriber::EnvFilter;

        let fmt_layer = tracing_subscriber::fmt::layer();
        let filter_layer = EnvFilter::try_new("debug").unwrap();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    });
}
