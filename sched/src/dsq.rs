//! Dispatch queues
//!
//! One FIFO per tier plus one direct-dispatch mailbox per CPU. A waker
//! that found an idle or preemptable CPU drops the wakee straight into
//! that CPU's mailbox; everything else flows through the tier queues.
//! Mailbox ids start at a reserved high base so a stored target id of
//! zero can mean "none".
//!
//! Queue length is mirrored in an atomic so the dispatch path can skip
//! empty queues without taking their locks.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::cpumask::MAX_CPUS;
use crate::task::{Pid, Tier};

/// First mailbox id; mailbox for CPU n is `MAILBOX_BASE + n`.
pub const MAILBOX_BASE: u32 = 1000;

/// Mailbox id for a CPU.
#[inline]
pub fn mailbox_dsq(cpu: u32) -> u32 {
    MAILBOX_BASE + (cpu & (MAX_CPUS as u32 - 1))
}

/// A queued task together with the slice it should run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedTask {
    pub pid: Pid,
    pub slice_ns: u32,
}

/// One FIFO with a lock-free length mirror.
struct Fifo {
    queue: Mutex<VecDeque<QueuedTask>>,
    len: AtomicU32,
}

impl Fifo {
    const fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            len: AtomicU32::new(0),
        }
    }

    fn push(&self, task: QueuedTask) {
        let mut q = self.queue.lock();
        q.push_back(task);
        self.len.fetch_add(1, Ordering::Release);
    }

    fn pop(&self) -> Option<QueuedTask> {
        // Empty queues are the common case on the dispatch walk; skip
        // the lock entirely for them.
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut q = self.queue.lock();
        let task = q.pop_front();
        if task.is_some() {
            self.len.fetch_sub(1, Ordering::Release);
        }
        task
    }

    fn len(&self) -> u32 {
        self.len.load(Ordering::Acquire)
    }
}

/// The full queue set: seven tier FIFOs and one mailbox per CPU.
pub struct DsqFabric {
    tiers: [Fifo; Tier::COUNT],
    mailboxes: Vec<Fifo>,
}

impl DsqFabric {
    /// Create every queue. Mailboxes are sized for the full mask width
    /// so dispatch never has to bounds-check a CPU id.
    pub fn new() -> Self {
        Self {
            tiers: [const { Fifo::new() }; Tier::COUNT],
            mailboxes: (0..MAX_CPUS).map(|_| Fifo::new()).collect(),
        }
    }

    fn queue_for(&self, id: u32) -> &Fifo {
        if (id as usize) < Tier::COUNT {
            &self.tiers[id as usize]
        } else if id >= MAILBOX_BASE && ((id - MAILBOX_BASE) as usize) < MAX_CPUS {
            &self.mailboxes[(id - MAILBOX_BASE) as usize]
        } else {
            // A garbled id degrades to the default tier instead of
            // dropping the task.
            &self.tiers[Tier::Interactive as usize]
        }
    }

    /// Insert into an arbitrary queue by id.
    pub fn insert(&self, id: u32, pid: Pid, slice_ns: u32) {
        self.queue_for(id).push(QueuedTask { pid, slice_ns });
    }

    /// Insert into a tier queue.
    pub fn insert_tier(&self, tier: Tier, pid: Pid, slice_ns: u32) {
        self.tiers[tier as usize].push(QueuedTask { pid, slice_ns });
    }

    /// Pull one task from a queue by id; cheap on empty queues.
    pub fn pop(&self, id: u32) -> Option<QueuedTask> {
        self.queue_for(id).pop()
    }

    /// Pull one task from a tier queue.
    pub fn pop_tier(&self, tier: Tier) -> Option<QueuedTask> {
        self.tiers[tier as usize].pop()
    }

    /// Number of tasks waiting in a queue.
    pub fn nr_queued(&self, id: u32) -> u32 {
        self.queue_for(id).len()
    }
}

impl Default for DsqFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_within_tier() {
        let fabric = DsqFabric::new();
        fabric.insert_tier(Tier::Gaming, Pid(1), 10);
        fabric.insert_tier(Tier::Gaming, Pid(2), 20);
        assert_eq!(fabric.pop_tier(Tier::Gaming).unwrap().pid, Pid(1));
        assert_eq!(fabric.pop_tier(Tier::Gaming).unwrap().pid, Pid(2));
        assert_eq!(fabric.pop_tier(Tier::Gaming), None);
    }

    #[test]
    fn test_mailbox_isolated_per_cpu() {
        let fabric = DsqFabric::new();
        fabric.insert(mailbox_dsq(5), Pid(9), 100);
        assert_eq!(fabric.pop(mailbox_dsq(4)), None);
        assert_eq!(fabric.pop(mailbox_dsq(5)).unwrap().pid, Pid(9));
    }

    #[test]
    fn test_nr_queued_tracks_inserts() {
        let fabric = DsqFabric::new();
        assert_eq!(fabric.nr_queued(Tier::Batch as u32), 0);
        fabric.insert_tier(Tier::Batch, Pid(1), 1);
        fabric.insert_tier(Tier::Batch, Pid(2), 1);
        assert_eq!(fabric.nr_queued(Tier::Batch as u32), 2);
        fabric.pop_tier(Tier::Batch);
        assert_eq!(fabric.nr_queued(Tier::Batch as u32), 1);
    }

    #[test]
    fn test_garbled_id_falls_back_to_interactive() {
        let fabric = DsqFabric::new();
        fabric.insert(9_999, Pid(7), 50);
        let pulled = fabric.pop_tier(Tier::Interactive).unwrap();
        assert_eq!(pulled.pid, Pid(7));
        assert_eq!(pulled.slice_ns, 50);
    }

    #[test]
    fn test_slice_travels_with_task() {
        let fabric = DsqFabric::new();
        fabric.insert_tier(Tier::Critical, Pid(3), 777);
        assert_eq!(fabric.pop_tier(Tier::Critical).unwrap().slice_ns, 777);
    }
}
