//! Scheduler statistics
//!
//! Counters are sharded per CPU: the hot paths only ever touch the
//! running CPU's shard, so no counter line bounces between cores. The
//! loader folds the shards into a [`StatsSnapshot`] whenever it wants
//! a report.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::cpumask::MAX_CPUS;
use crate::task::Tier;

/// One CPU's counter shard.
///
/// Single-writer by construction (only the owning CPU records into its
/// shard), so all stores are relaxed and the max tracker is a plain
/// load/compare/store.
pub struct CpuStats {
    /// Dispatches routed on the wake path (direct or tier insert).
    pub nr_new_flow_dispatches: AtomicU64,
    /// Dispatches of tasks re-queued without a wake.
    pub nr_old_flow_dispatches: AtomicU64,
    /// Tier-queue inserts by tier.
    pub nr_tier_dispatches: [AtomicU64; Tier::COUNT],
    /// Tasks whose score crossed into the sparse regime.
    pub nr_sparse_promotions: AtomicU64,
    /// Tasks whose score fell out of the sparse regime.
    pub nr_sparse_demotions: AtomicU64,
    /// Demotions forced by the wait-budget window.
    pub nr_wait_demotions: AtomicU64,
    /// Total observed wake-to-run wait (ns).
    pub total_wait_ns: AtomicU64,
    /// Number of waits observed.
    pub nr_waits: AtomicU64,
    /// Longest wait observed (ns).
    pub max_wait_ns: AtomicU64,
    /// Per-tier total wait (ns).
    pub tier_total_wait_ns: [AtomicU64; Tier::COUNT],
    /// Per-tier wait count.
    pub tier_nr_waits: [AtomicU64; Tier::COUNT],
    /// Per-tier longest wait (ns).
    pub tier_max_wait_ns: [AtomicU64; Tier::COUNT],
    /// Starvation preempt kicks by tier of the offender.
    pub nr_starvation_preempts: [AtomicU64; Tier::COUNT],
    /// Preemptions injected for latency-critical wakeups.
    pub nr_input_preempts: AtomicU64,
}

impl CpuStats {
    pub const fn new() -> Self {
        Self {
            nr_new_flow_dispatches: AtomicU64::new(0),
            nr_old_flow_dispatches: AtomicU64::new(0),
            nr_tier_dispatches: [const { AtomicU64::new(0) }; Tier::COUNT],
            nr_sparse_promotions: AtomicU64::new(0),
            nr_sparse_demotions: AtomicU64::new(0),
            nr_wait_demotions: AtomicU64::new(0),
            total_wait_ns: AtomicU64::new(0),
            nr_waits: AtomicU64::new(0),
            max_wait_ns: AtomicU64::new(0),
            tier_total_wait_ns: [const { AtomicU64::new(0) }; Tier::COUNT],
            tier_nr_waits: [const { AtomicU64::new(0) }; Tier::COUNT],
            tier_max_wait_ns: [const { AtomicU64::new(0) }; Tier::COUNT],
            nr_starvation_preempts: [const { AtomicU64::new(0) }; Tier::COUNT],
            nr_input_preempts: AtomicU64::new(0),
        }
    }

    /// Record one observed wake-to-run wait.
    pub fn record_wait(&self, tier: Tier, wait_ns: u64) {
        let t = tier as usize;
        self.total_wait_ns.fetch_add(wait_ns, Ordering::Relaxed);
        self.nr_waits.fetch_add(1, Ordering::Relaxed);
        self.tier_total_wait_ns[t].fetch_add(wait_ns, Ordering::Relaxed);
        self.tier_nr_waits[t].fetch_add(1, Ordering::Relaxed);
        if wait_ns > self.max_wait_ns.load(Ordering::Relaxed) {
            self.max_wait_ns.store(wait_ns, Ordering::Relaxed);
        }
        if wait_ns > self.tier_max_wait_ns[t].load(Ordering::Relaxed) {
            self.tier_max_wait_ns[t].store(wait_ns, Ordering::Relaxed);
        }
    }

    /// Record a tier-queue insert.
    pub fn record_tier_dispatch(&self, tier: Tier, wakeup: bool) {
        if wakeup {
            self.nr_new_flow_dispatches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.nr_old_flow_dispatches.fetch_add(1, Ordering::Relaxed);
        }
        self.nr_tier_dispatches[tier as usize].fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for CpuStats {
    fn default() -> Self {
        Self::new()
    }
}

/// All CPU shards.
pub struct Stats {
    cpus: [CpuStats; MAX_CPUS],
}

impl Stats {
    pub const fn new() -> Self {
        Self {
            cpus: [const { CpuStats::new() }; MAX_CPUS],
        }
    }

    /// Shard for a CPU; out-of-range ids are folded into range rather
    /// than trusted.
    #[inline]
    pub fn cpu(&self, cpu: u32) -> &CpuStats {
        &self.cpus[cpu as usize & (MAX_CPUS - 1)]
    }

    /// Fold every shard into one report.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut out = StatsSnapshot::default();
        for shard in &self.cpus {
            out.nr_new_flow_dispatches += shard.nr_new_flow_dispatches.load(Ordering::Relaxed);
            out.nr_old_flow_dispatches += shard.nr_old_flow_dispatches.load(Ordering::Relaxed);
            out.nr_sparse_promotions += shard.nr_sparse_promotions.load(Ordering::Relaxed);
            out.nr_sparse_demotions += shard.nr_sparse_demotions.load(Ordering::Relaxed);
            out.nr_wait_demotions += shard.nr_wait_demotions.load(Ordering::Relaxed);
            out.total_wait_ns += shard.total_wait_ns.load(Ordering::Relaxed);
            out.nr_waits += shard.nr_waits.load(Ordering::Relaxed);
            out.max_wait_ns = out.max_wait_ns.max(shard.max_wait_ns.load(Ordering::Relaxed));
            out.nr_input_preempts += shard.nr_input_preempts.load(Ordering::Relaxed);
            for t in 0..Tier::COUNT {
                out.nr_tier_dispatches[t] += shard.nr_tier_dispatches[t].load(Ordering::Relaxed);
                out.tier_total_wait_ns[t] += shard.tier_total_wait_ns[t].load(Ordering::Relaxed);
                out.tier_nr_waits[t] += shard.tier_nr_waits[t].load(Ordering::Relaxed);
                out.tier_max_wait_ns[t] = out.tier_max_wait_ns[t]
                    .max(shard.tier_max_wait_ns[t].load(Ordering::Relaxed));
                out.nr_starvation_preempts[t] +=
                    shard.nr_starvation_preempts[t].load(Ordering::Relaxed);
            }
        }
        out
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time aggregate of every shard, for the loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub nr_new_flow_dispatches: u64,
    pub nr_old_flow_dispatches: u64,
    pub nr_tier_dispatches: [u64; Tier::COUNT],
    pub nr_sparse_promotions: u64,
    pub nr_sparse_demotions: u64,
    pub nr_wait_demotions: u64,
    pub total_wait_ns: u64,
    pub nr_waits: u64,
    pub max_wait_ns: u64,
    pub tier_total_wait_ns: [u64; Tier::COUNT],
    pub tier_nr_waits: [u64; Tier::COUNT],
    pub tier_max_wait_ns: [u64; Tier::COUNT],
    pub nr_starvation_preempts: [u64; Tier::COUNT],
    pub nr_input_preempts: u64,
}

impl StatsSnapshot {
    /// Mean wake-to-run wait in nanoseconds, zero when nothing was
    /// observed.
    pub fn avg_wait_ns(&self) -> u64 {
        if self.nr_waits == 0 {
            0
        } else {
            self.total_wait_ns / self.nr_waits
        }
    }
}
