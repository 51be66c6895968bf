//! Queue descriptors and the category-to-queue registry.
//!
//! Descriptors are configuration contributions: registered before or during
//! activation, immutable while their pool exists. Merging and hot-reload are
//! the surrounding component framework's business, not this crate's.

use std::collections::HashMap;

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::Deserialize;
use tracing::{info, warn};

/// Queue id categories fall through to when they carry no explicit binding.
pub const DEFAULT_QUEUE_ID: &str = "default";

/// Pool size substituted when a descriptor leaves `max_threads` at 0.
pub const DEFAULT_MAX_THREADS: usize = 4;

/// Configuration of one named work queue.
///
/// `capacity == 0` means unbounded. A priority queue is always unbounded:
/// a non-zero capacity on a priority descriptor is ignored (with a warning
/// at registration).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Builder, Getters, CopyGetters)]
#[builder(pattern = "owned", setter(into))]
pub struct WorkQueueDescriptor {
    /// Queue identifier, unique within the registry.
    #[getset(get = "pub")]
    id: String,

    /// Human-readable name for logs.
    #[serde(default)]
    #[builder(default)]
    #[getset(get = "pub")]
    name: String,

    /// Category strings routed to this queue.
    #[serde(default)]
    #[builder(default)]
    #[getset(get = "pub")]
    categories: Vec<String>,

    /// Worker threads in the pool; 0 selects [`DEFAULT_MAX_THREADS`].
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    max_threads: usize,

    /// Bounded-queue capacity; 0 means unbounded.
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    capacity: usize,

    /// Order the queue by the work's priority instead of FIFO.
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    use_priority: bool,

    /// Age in seconds after which `cleanup` drops completed work; 0 keeps
    /// completed work until explicitly cleared.
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    clear_completed_after_secs: u64,
}

impl WorkQueueDescriptor {
    pub fn builder() -> WorkQueueDescriptorBuilder {
        WorkQueueDescriptorBuilder::default()
    }

    /// Pool size with the zero-to-default substitution applied.
    pub fn effective_max_threads(&self) -> usize {
        if self.max_threads == 0 {
            DEFAULT_MAX_THREADS
        } else {
            self.max_threads
        }
    }

    /// Capacity with the priority-queue override applied.
    pub fn effective_capacity(&self) -> usize {
        if self.use_priority {
            0
        } else {
            self.capacity
        }
    }
}

/// Registry of queue descriptors, keyed by queue id.
///
/// Resolution policy for a category: explicit binding, then the queue named
/// [`DEFAULT_QUEUE_ID`] if one is registered, then nothing.
#[derive(Debug, Default)]
pub struct WorkQueueDescriptorRegistry {
    descriptors: HashMap<String, WorkQueueDescriptor>,
    categories: HashMap<String, String>,
}

impl WorkQueueDescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor, replacing any previous one with the same id
    /// and binding its categories.
    pub fn add_contribution(&mut self, descriptor: WorkQueueDescriptor) {
        if descriptor.use_priority() && descriptor.capacity() > 0 {
            warn!(
                queue_id = %descriptor.id(),
                capacity = descriptor.capacity(),
                "priority queues are unbounded, capacity is ignored"
            );
        }
        for category in descriptor.categories() {
            self.categories
                .insert(category.clone(), descriptor.id().clone());
        }
        info!(queue_id = %descriptor.id(), "registered work queue");
        self.descriptors
            .insert(descriptor.id().clone(), descriptor);
    }

    /// Removes a descriptor and its category bindings.
    pub fn remove_contribution(&mut self, queue_id: &str) -> Option<WorkQueueDescriptor> {
        let removed = self.descriptors.remove(queue_id);
        if removed.is_some() {
            self.categories.retain(|_, id| id != queue_id);
            info!(queue_id, "unregistered work queue");
        }
        removed
    }

    pub fn descriptor(&self, queue_id: &str) -> Option<&WorkQueueDescriptor> {
        self.descriptors.get(queue_id)
    }

    pub fn queue_ids(&self) -> Vec<String> {
        self.descriptors.keys().cloned().collect()
    }

    /// Resolves a category to a queue id, falling through to the default
    /// queue when the category is absent or unbound.
    pub fn queue_id_for_category(&self, category: Option<&str>) -> Option<&str> {
        if let Some(category) = category {
            if let Some(queue_id) = self.categories.get(category) {
                return Some(queue_id);
            }
        }
        self.descriptors
            .contains_key(DEFAULT_QUEUE_ID)
            .then_some(DEFAULT_QUEUE_ID)
    }
}
