//! Per-task context storage
//!
//! A map from task id to its scheduling context. The fast path is a
//! read-locked lookup; allocation lives in a separate non-inlined cold
//! path so the lookup stays tight, and is only ever invoked from the
//! run hook, where the framework serializes callers per CPU and the
//! write lock sees no wake-path contention.
//!
//! Contexts are handed out as `Arc` clones: the map entry can be
//! removed while another CPU still holds a reference from an in-flight
//! wake, and the context simply outlives the entry.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::RwLock;

use crate::slice::initial_deficit_us;
use crate::task::{Pid, TaskContext};

/// Owner of every live task context.
pub struct ContextStore {
    map: RwLock<BTreeMap<Pid, Arc<TaskContext>>>,
    quantum_ns: u64,
    initial_deficit_us: u16,
}

impl ContextStore {
    /// Empty store; new contexts start with the given quantum and the
    /// new-flow bonus folded into their deficit.
    pub fn new(quantum_ns: u64, new_flow_bonus_ns: u64) -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            quantum_ns,
            initial_deficit_us: initial_deficit_us(quantum_ns, new_flow_bonus_ns),
        }
    }

    /// Look up an existing context.
    #[inline]
    pub fn get(&self, pid: Pid) -> Option<Arc<TaskContext>> {
        self.map.read().get(&pid).cloned()
    }

    /// Look up a context, creating it on first use.
    #[inline]
    pub fn get_or_create(&self, pid: Pid) -> Arc<TaskContext> {
        if let Some(ctx) = self.get(pid) {
            return ctx;
        }
        self.create_cold(pid)
    }

    /// Allocation path, kept out of line of the lookup.
    #[inline(never)]
    fn create_cold(&self, pid: Pid) -> Arc<TaskContext> {
        let mut map = self.map.write();
        map.entry(pid)
            .or_insert_with(|| Arc::new(TaskContext::fresh(self.quantum_ns, self.initial_deficit_us)))
            .clone()
    }

    /// Release a task's context when it leaves the scheduler class.
    pub fn remove(&self, pid: Pid) -> bool {
        self.map.write().remove(&pid).is_some()
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// True when no contexts exist.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    #[test]
    fn test_get_misses_without_create() {
        let store = ContextStore::new(4_000_000, 8_000_000);
        assert!(store.get(Pid(1)).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_create_initializes_deficit() {
        let store = ContextStore::new(4_000_000, 8_000_000);
        let ctx = store.get_or_create(Pid(1));
        assert_eq!(ctx.deficit_us.load(Ordering::Relaxed), 11_718);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let store = ContextStore::new(4_000_000, 8_000_000);
        let a = store.get_or_create(Pid(1));
        a.rng_state.store(42, Ordering::Relaxed);
        let b = store.get_or_create(Pid(1));
        assert_eq!(b.rng_state.load(Ordering::Relaxed), 42);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_releases_entry() {
        let store = ContextStore::new(4_000_000, 8_000_000);
        store.get_or_create(Pid(1));
        assert!(store.remove(Pid(1)));
        assert!(!store.remove(Pid(1)));
        assert!(store.get(Pid(1)).is_none());
    }

    #[test]
    fn test_held_reference_survives_removal() {
        let store = ContextStore::new(4_000_000, 8_000_000);
        let held = store.get_or_create(Pid(1));
        store.remove(Pid(1));
        // The wake path may still be holding this context.
        assert_eq!(held.deficit_us.load(Ordering::Relaxed), 11_718);
    }
}
