//! Counting of outbound cloud API calls.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;

/// `(resource, verb)` pair a call is attributed to, e.g. `("instance_group_managers", "resize")`.
pub type CallKey = (&'static str, &'static str);

/// Counts cloud requests per resource and verb.
///
/// Cloning is cheap; clones share counters.
#[derive(Debug, Clone, Default)]
pub struct ApiCallCounter {
    counts: Arc<DashMap<CallKey, AtomicU64>>,
}

impl ApiCallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, resource: &'static str, verb: &'static str) {
        self.counts
            .entry((resource, verb))
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, resource: &'static str, verb: &'static str) -> u64 {
        self.counts
            .get(&(resource, verb))
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<CallKey, u64> {
        self.counts
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}
