//! Scheduler configuration
//!
//! All knobs are fixed before the scheduler attaches and never change
//! afterwards, so everything here is plain data with no interior
//! mutability. Per-tier parameters are consolidated into an
//! array-of-structures table: one lookup brings a tier's starvation
//! threshold, wait budget, and slice multiplier into cache together,
//! and the table carries a padding eighth entry so `tier & 7` indexing
//! never needs a bounds branch.

use crate::task::Tier;
use crate::topology::Topology;

/// Fixed-point scale for slice multipliers (1024 = 1.0x).
pub const FIXED_POINT_ONE: u32 = 1024;

/// Default scheduling quantum: 4ms.
pub const DEFAULT_QUANTUM_NS: u64 = 4_000_000;

/// Default new-flow bonus absorbed into the initial deficit: 8ms.
pub const DEFAULT_NEW_FLOW_BONUS_NS: u64 = 8_000_000;

/// Default sparse threshold, in 1/1024 units of the quantum.
pub const DEFAULT_SPARSE_THRESHOLD: u64 = 100;

/// Default starvation ceiling for the slowest tier: 100ms.
pub const DEFAULT_STARVATION_NS: u64 = 100_000_000;

/// Parameters for one priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierParams {
    /// Run time above which the owning CPU is kicked to preempt (ns).
    pub starvation_ns: u64,
    /// Wake-to-run latency above which a violation is recorded (ns).
    /// Zero disables the budget for this tier.
    pub wait_budget_ns: u64,
    /// Slice multiplier, fixed point with [`FIXED_POINT_ONE`] = 1.0x.
    pub slice_multiplier: u32,
}

/// Per-tier parameter table, eight entries with a padding eighth so the
/// index is always `tier & 7`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    entries: [TierParams; 8],
}

impl TierTable {
    /// Build a table from the seven real tiers; the eighth entry is
    /// padding that mirrors the least surprising neighbors.
    pub fn new(tiers: [TierParams; Tier::COUNT]) -> Self {
        let pad = TierParams {
            starvation_ns: tiers[6].starvation_ns,
            wait_budget_ns: 0,
            slice_multiplier: tiers[3].slice_multiplier,
        };
        Self {
            entries: [
                tiers[0], tiers[1], tiers[2], tiers[3], tiers[4], tiers[5], tiers[6], pad,
            ],
        }
    }

    /// Gaming-profile defaults: tight budgets and short slices at the
    /// latency end, loose budgets and long slices at the bulk end.
    pub fn gaming_profile() -> Self {
        Self::new([
            // Critical Latency
            TierParams {
                starvation_ns: 5_000_000,
                wait_budget_ns: 100_000,
                slice_multiplier: 717, // 0.7x
            },
            // Realtime
            TierParams {
                starvation_ns: 3_000_000,
                wait_budget_ns: 750_000,
                slice_multiplier: 819, // 0.8x
            },
            // Critical
            TierParams {
                starvation_ns: 4_000_000,
                wait_budget_ns: 2_000_000,
                slice_multiplier: 922, // 0.9x
            },
            // Gaming
            TierParams {
                starvation_ns: 8_000_000,
                wait_budget_ns: 4_000_000,
                slice_multiplier: 1024, // 1.0x
            },
            // Interactive
            TierParams {
                starvation_ns: 16_000_000,
                wait_budget_ns: 8_000_000,
                slice_multiplier: 1126, // 1.1x
            },
            // Batch
            TierParams {
                starvation_ns: 40_000_000,
                wait_budget_ns: 20_000_000,
                slice_multiplier: 1229, // 1.2x
            },
            // Background: no wait budget
            TierParams {
                starvation_ns: DEFAULT_STARVATION_NS,
                wait_budget_ns: 0,
                slice_multiplier: 1331, // 1.3x
            },
        ])
    }

    /// Parameters for a tier, branch-free.
    #[inline]
    pub fn params(&self, tier: Tier) -> &TierParams {
        &self.entries[tier as usize & 7]
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::gaming_profile()
    }
}

/// Scheduler configuration, set once by the loader before attach.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Base scheduling quantum (ns).
    pub quantum_ns: u64,
    /// Extra deficit credit granted to brand-new tasks (ns).
    pub new_flow_bonus_ns: u64,
    /// Sparse threshold in 1/1024 units of the quantum; runs shorter
    /// than `quantum * sparse_threshold / 1024` count as sparse.
    pub sparse_threshold: u64,
    /// Base starvation ceiling (ns); the per-tier table refines this.
    pub starvation_ns: u64,
    /// Gate for all statistics accounting.
    pub enable_stats: bool,
    /// Per-tier parameters.
    pub tiers: TierTable,
    /// Hardware topology, or [`Topology::flat`] when unknown.
    pub topology: Topology,
}

impl SchedConfig {
    /// Pre-computed sparse threshold in nanoseconds.
    ///
    /// Uses a `>> 10` in place of a division by 1000 so the value can
    /// be recomputed anywhere without integer division.
    #[inline]
    pub fn cached_threshold_ns(&self) -> u64 {
        (self.quantum_ns * self.sparse_threshold) >> 10
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            quantum_ns: DEFAULT_QUANTUM_NS,
            new_flow_bonus_ns: DEFAULT_NEW_FLOW_BONUS_NS,
            sparse_threshold: DEFAULT_SPARSE_THRESHOLD,
            starvation_ns: DEFAULT_STARVATION_NS,
            enable_stats: true,
            tiers: TierTable::default(),
            topology: Topology::flat(),
        }
    }
}
