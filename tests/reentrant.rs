use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use txwork::{Scheduling, WorkManager, WorkStateFilter};

use crate::common::{enable_logs, queue, TestWork};

mod common;

/// Every job submits a follow-up from inside its own run, on a bounded
/// queue small enough that external producers block. The worker-thread
/// bypass must keep the pool making progress on all of it.
#[test]
fn reentrant_producers_do_not_deadlock_a_bounded_queue() {
    enable_logs();
    let manager = Arc::new(
        WorkManager::options()
            .register_queue(queue("default", 2, 4))
            .init(),
    );

    let runs = Arc::new(AtomicUsize::new(0));
    let initial: Vec<Arc<TestWork>> = (0..10)
        .map(|n| {
            let follow_up_manager = Arc::clone(&manager);
            let follow_up_runs = Arc::clone(&runs);
            Arc::new(
                TestWork::new(&format!("initial-{n}"))
                    .with_sleep(Duration::from_millis(10))
                    .with_runs(Arc::clone(&runs))
                    .on_run(move || {
                        let follow_up = Arc::new(
                            TestWork::new(&format!("follow-{n}"))
                                .with_sleep(Duration::from_millis(10))
                                .with_runs(Arc::clone(&follow_up_runs)),
                        );
                        follow_up_manager
                            .schedule(follow_up, Scheduling::Enqueue, false)
                            .expect("worker-originated submit must succeed");
                    }),
            )
        })
        .collect();

    for work in &initial {
        manager
            .schedule(Arc::clone(work) as Arc<dyn txwork::Work>, Scheduling::Enqueue, false)
            .expect("schedule");
    }

    assert!(
        manager
            .await_completion(Duration::from_secs(10))
            .expect("await"),
        "initial and follow-up work must all complete without deadlocking"
    );
    assert_eq!(runs.load(Ordering::SeqCst), 20);
    assert_eq!(
        manager
            .list_work("default", Some(WorkStateFilter::Completed))
            .expect("list")
            .len(),
        20
    );
}

/// The bypass keys off the configured thread-name prefix, so it must hold
/// for a custom prefix too.
#[test]
fn custom_thread_prefix_still_identifies_workers() {
    let manager = Arc::new(
        WorkManager::options()
            .thread_prefix("bg-worker-")
            .register_queue(queue("default", 1, 2))
            .init(),
    );
    assert_eq!(manager.thread_prefix(), "bg-worker-");

    let runs = Arc::new(AtomicUsize::new(0));
    let spawner = {
        let follow_up_manager = Arc::clone(&manager);
        let follow_up_runs = Arc::clone(&runs);
        Arc::new(
            TestWork::new("spawner")
                .with_runs(Arc::clone(&runs))
                .on_run(move || {
                    for n in 0..4 {
                        let follow_up = Arc::new(
                            TestWork::new(&format!("spawned-{n}"))
                                .with_runs(Arc::clone(&follow_up_runs)),
                        );
                        follow_up_manager
                            .schedule(follow_up, Scheduling::Enqueue, false)
                            .expect("worker-originated submit must succeed");
                    }
                }),
        )
    };

    manager
        .schedule(Arc::clone(&spawner) as Arc<dyn txwork::Work>, Scheduling::Enqueue, false)
        .expect("schedule");
    assert!(manager
        .await_completion(Duration::from_secs(10))
        .expect("await"));
    assert_eq!(runs.load(Ordering::SeqCst), 5);
}
