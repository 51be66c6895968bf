//! Runnable queues backing the work pools: a FIFO queue whose `offer` blocks
//! instead of dropping, with a reserved region for re-entrant producers, and
//! an unbounded priority queue.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use txwork_job::Work;
use txwork_registry::WorkQueueDescriptor;

/// How long a rate-limited producer sleeps between capacity checks.
const RATE_LIMIT_POLL: Duration = Duration::from_millis(100);

/// FIFO queue with a user-visible capacity `C` and a blocking `offer`.
///
/// Internally allocates `2 * C` slots. External producers are rate-limited
/// behind a single lock until `remaining >= C`, which reserves the other half
/// for producers running on pool worker threads (recognised by their thread
/// name prefix). Without the reserve, workers submitting follow-up work to a
/// full queue would deadlock the pool.
pub(crate) struct ReentrantBlockingQueue {
    slots: Mutex<VecDeque<Arc<dyn Work>>>,
    not_empty: Condvar,
    not_full: Condvar,
    /// User-visible capacity; `None` disables bounding entirely.
    capacity: Option<usize>,
    /// Serialises external producers so they cannot collectively overrun
    /// the reserved region between the capacity check and the put.
    limited_put_lock: Mutex<()>,
    worker_prefix: String,
}

impl ReentrantBlockingQueue {
    pub fn new(capacity: usize, worker_prefix: &str) -> Self {
        Self {
            slots: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: (capacity > 0).then_some(capacity),
            limited_put_lock: Mutex::new(()),
            worker_prefix: worker_prefix.to_string(),
        }
    }

    fn total_slots(&self) -> Option<usize> {
        self.capacity.map(|c| 2 * c)
    }

    /// Blocking enqueue. Re-entrant producers draw from the full `2 * C`
    /// allocation; external producers wait until the reserved half is free.
    pub fn offer(&self, work: Arc<dyn Work>) {
        let Some(limit) = self.capacity else {
            self.put(work);
            return;
        };
        let reentrant = thread::current()
            .name()
            .is_some_and(|name| name.starts_with(&self.worker_prefix));
        if reentrant {
            self.put(work);
        } else {
            self.limited_put(work, limit);
        }
    }

    fn put(&self, work: Arc<dyn Work>) {
        let mut slots = self.slots.lock();
        if let Some(total) = self.total_slots() {
            while slots.len() >= total {
                self.not_full.wait(&mut slots);
            }
        }
        slots.push_back(work);
        self.not_empty.notify_one();
    }

    fn limited_put(&self, work: Arc<dyn Work>, limit: usize) {
        let _rate = self.limited_put_lock.lock();
        loop {
            let len = self.slots.lock().len();
            let remaining = (2 * limit).saturating_sub(len);
            if remaining >= limit {
                break;
            }
            thread::sleep(RATE_LIMIT_POLL);
        }
        self.put(work);
    }

    pub fn poll(&self, timeout: Duration) -> Option<Arc<dyn Work>> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.slots.lock();
        loop {
            if let Some(work) = slots.pop_front() {
                self.not_full.notify_one();
                return Some(work);
            }
            if Instant::now() >= deadline {
                return None;
            }
            self.not_empty.wait_until(&mut slots, deadline);
        }
    }

    /// Removes the first entry equal to `target`; callers loop to drain
    /// duplicates.
    pub fn remove_matching(&self, target: &dyn Work) -> bool {
        let mut slots = self.slots.lock();
        if let Some(index) = slots.iter().position(|work| work.matches(target)) {
            slots.remove(index);
            self.not_full.notify_one();
            true
        } else {
            false
        }
    }

    pub fn drain(&self) -> Vec<Arc<dyn Work>> {
        let mut slots = self.slots.lock();
        let drained = slots.drain(..).collect();
        self.not_full.notify_all();
        drained
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn wake_all(&self) {
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

struct PrioritizedWork {
    work: Arc<dyn Work>,
    priority: i64,
    seq: u64,
}

// BinaryHeap is a max-heap; reverse the comparisons so the lowest priority
// value (and, among equals, the earliest submission) pops first.
impl Ord for PrioritizedWork {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PrioritizedWork {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PrioritizedWork {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for PrioritizedWork {}

/// Unbounded queue ordered by the priority the work exposes.
pub(crate) struct PriorityWorkQueue {
    heap: Mutex<PriorityHeap>,
    not_empty: Condvar,
}

#[derive(Default)]
struct PriorityHeap {
    entries: BinaryHeap<PrioritizedWork>,
    next_seq: u64,
}

impl PriorityWorkQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(PriorityHeap::default()),
            not_empty: Condvar::new(),
        }
    }

    pub fn offer(&self, work: Arc<dyn Work>) {
        let mut heap = self.heap.lock();
        let seq = heap.next_seq;
        heap.next_seq += 1;
        let priority = work.priority();
        heap.entries.push(PrioritizedWork {
            work,
            priority,
            seq,
        });
        self.not_empty.notify_one();
    }

    pub fn poll(&self, timeout: Duration) -> Option<Arc<dyn Work>> {
        let deadline = Instant::now() + timeout;
        let mut heap = self.heap.lock();
        loop {
            if let Some(entry) = heap.entries.pop() {
                return Some(entry.work);
            }
            if Instant::now() >= deadline {
                return None;
            }
            self.not_empty.wait_until(&mut heap, deadline);
        }
    }

    pub fn remove_matching(&self, target: &dyn Work) -> bool {
        let mut heap = self.heap.lock();
        let mut entries: Vec<PrioritizedWork> = std::mem::take(&mut heap.entries).into_vec();
        let found = entries
            .iter()
            .position(|entry| entry.work.matches(target));
        if let Some(index) = found {
            entries.remove(index);
        }
        heap.entries = entries.into();
        found.is_some()
    }

    pub fn drain(&self) -> Vec<Arc<dyn Work>> {
        let mut heap = self.heap.lock();
        let mut drained = Vec::with_capacity(heap.entries.len());
        while let Some(entry) = heap.entries.pop() {
            drained.push(entry.work);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.heap.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().entries.is_empty()
    }

    pub fn wake_all(&self) {
        self.not_empty.notify_all();
    }
}

/// The runnable queue behind one pool, picked from the queue descriptor.
pub(crate) enum PoolQueue {
    Fifo(ReentrantBlockingQueue),
    Priority(PriorityWorkQueue),
}

impl PoolQueue {
    pub fn for_descriptor(descriptor: &WorkQueueDescriptor, worker_prefix: &str) -> Self {
        if descriptor.use_priority() {
            PoolQueue::Priority(PriorityWorkQueue::new())
        } else {
            PoolQueue::Fifo(ReentrantBlockingQueue::new(
                descriptor.effective_capacity(),
                worker_prefix,
            ))
        }
    }

    pub fn offer(&self, work: Arc<dyn Work>) {
        match self {
            PoolQueue::Fifo(queue) => queue.offer(work),
            PoolQueue::Priority(queue) => queue.offer(work),
        }
    }

    pub fn poll(&self, timeout: Duration) -> Option<Arc<dyn Work>> {
        match self {
            PoolQueue::Fifo(queue) => queue.poll(timeout),
            PoolQueue::Priority(queue) => queue.poll(timeout),
        }
    }

    pub fn remove_matching(&self, target: &dyn Work) -> bool {
        match self {
            PoolQueue::Fifo(queue) => queue.remove_matching(target),
            PoolQueue::Priority(queue) => queue.remove_matching(target),
        }
    }

    pub fn drain(&self) -> Vec<Arc<dyn Work>> {
        match self {
            PoolQueue::Fifo(queue) => queue.drain(),
            PoolQueue::Priority(queue) => queue.drain(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PoolQueue::Fifo(queue) => queue.is_empty(),
            PoolQueue::Priority(queue) => queue.is_empty(),
        }
    }

    pub fn wake_all(&self) {
        match self {
            PoolQueue::Fifo(queue) => queue.wake_all(),
            PoolQueue::Priority(queue) => queue.wake_all(),
        }
    }
}
