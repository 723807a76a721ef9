//! Per-task scheduling state
//!
//! Each task carries one 64-byte context: a handful of u16/u32 scalars
//! plus a single packed status word holding flags, tier, sparse score,
//! and the wait-budget window. The packed word is always read and
//! written whole through relaxed atomics, so concurrent observers on
//! other CPUs may see a stale word but never a torn one. A stale read
//! costs at most one misclassified dispatch.
//!
//! Packed layout, high to low:
//!
//! ```text
//! [31:30] reserved  [29:26] flags  [25:23] tier  [22:16] score
//! [15:8]  wait window (violations:4 | checks:4)
//! [7:0]   reserved (was a runtime-estimator error term, retired)
//! ```

use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

/// Task identifier as seen by the kernel framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kernel-side view of a schedulable task, as handed to the callbacks.
///
/// `sum_exec_runtime` is maintained by the kernel; the scheduler only
/// reads it as a free entropy source in the dispatch lottery.
#[derive(Debug)]
pub struct Task {
    /// Task id.
    pub pid: Pid,
    /// Total executed time (ns), kernel-maintained.
    pub sum_exec_runtime: AtomicU64,
}

impl Task {
    /// New task view with zero accumulated runtime.
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            sum_exec_runtime: AtomicU64::new(0),
        }
    }
}

/// Priority tiers, highest priority first.
///
/// The ordering is total: a numerically smaller tier always dispatches
/// ahead of a larger one (outside the anti-starvation lottery).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    /// Input handlers and IRQ-like threads, sub-50us average runs.
    CriticalLatency = 0,
    /// Audio/video pump threads, sub-500us average runs.
    Realtime = 1,
    /// Very sparse tasks such as compositors.
    Critical = 2,
    /// Sparse, bursty tasks: game threads, UI.
    Gaming = 3,
    /// Default tier for ordinary applications.
    Interactive = 4,
    /// Heavier work, demoted from Interactive.
    Batch = 5,
    /// Bulk CPU burners: compilers, encoders.
    Background = 6,
}

impl Tier {
    /// Number of real tiers.
    pub const COUNT: usize = 7;

    /// All tiers in dispatch priority order.
    pub const PRIORITY_ORDER: [Tier; Tier::COUNT] = [
        Tier::CriticalLatency,
        Tier::Realtime,
        Tier::Critical,
        Tier::Gaming,
        Tier::Interactive,
        Tier::Batch,
        Tier::Background,
    ];

    /// Decode a raw tier index; anything out of range degrades to the
    /// Interactive default rather than trusting the encoding.
    #[inline]
    pub fn from_index(raw: u8) -> Tier {
        match raw {
            0 => Tier::CriticalLatency,
            1 => Tier::Realtime,
            2 => Tier::Critical,
            3 => Tier::Gaming,
            4 => Tier::Interactive,
            5 => Tier::Batch,
            6 => Tier::Background,
            _ => Tier::Interactive,
        }
    }
}

bitflags! {
    /// Per-task flow flags (4-bit field in the packed word).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlowFlags: u8 {
        /// Task was created recently and still carries its deficit bonus.
        const NEW = 1 << 0;
    }
}

/// Wait-budget window: two saturating 4-bit counters.
///
/// `checks` counts completed wake-to-run cycles at the current tier,
/// `violations` counts the subset whose wait exceeded the tier budget.
/// Both saturate at 15; the window logic resets them long before that
/// except for the budget-free Background tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitData(u8);

impl WaitData {
    const NIBBLE: u8 = 0x0F;

    /// Decode from the packed byte.
    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw byte, `violations << 4 | checks`.
    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Completed wake-to-run cycles observed, saturating.
    #[inline]
    pub fn checks(self) -> u8 {
        self.0 & Self::NIBBLE
    }

    /// Budget violations observed, saturating.
    #[inline]
    pub fn violations(self) -> u8 {
        self.0 >> 4
    }

    /// Record one more cycle, saturating both counters at 15.
    #[inline]
    pub fn record(self, violated: bool) -> Self {
        let checks = (self.checks() + 1).min(Self::NIBBLE);
        let violations = (self.violations() + u8::from(violated)).min(Self::NIBBLE);
        Self(violations << 4 | checks)
    }

    /// Start a fresh window.
    #[inline]
    pub fn reset() -> Self {
        Self(0)
    }
}

const SHIFT_WAIT: u32 = 8;
const SHIFT_SCORE: u32 = 16;
const SHIFT_TIER: u32 = 23;
const SHIFT_FLAGS: u32 = 26;

const MASK_WAIT: u32 = 0xFF;
const MASK_SCORE: u32 = 0x7F;
const MASK_TIER: u32 = 0x07;
const MASK_FLAGS: u32 = 0x0F;

/// Starting score for a task with no history: dead middle of the range.
pub const INITIAL_SCORE: u8 = 50;

/// The packed status word. Copy-on-write value type: mutations return a
/// new word so the caller can compare and store once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedInfo(u32);

impl PackedInfo {
    /// Word for a freshly created task: Interactive, mid score, NEW.
    pub fn initial() -> Self {
        Self(0)
            .with_score(INITIAL_SCORE)
            .with_tier(Tier::Interactive)
            .with_flags(FlowFlags::NEW)
    }

    /// Rehydrate from a raw word.
    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw word.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Sparse score, 0..=100.
    #[inline]
    pub fn score(self) -> u8 {
        ((self.0 >> SHIFT_SCORE) & MASK_SCORE) as u8
    }

    #[inline]
    pub fn with_score(self, score: u8) -> Self {
        let cleared = self.0 & !(MASK_SCORE << SHIFT_SCORE);
        Self(cleared | ((score as u32 & MASK_SCORE) << SHIFT_SCORE))
    }

    /// Current tier.
    #[inline]
    pub fn tier(self) -> Tier {
        Tier::from_index(((self.0 >> SHIFT_TIER) & MASK_TIER) as u8)
    }

    #[inline]
    pub fn with_tier(self, tier: Tier) -> Self {
        let cleared = self.0 & !(MASK_TIER << SHIFT_TIER);
        Self(cleared | ((tier as u32 & MASK_TIER) << SHIFT_TIER))
    }

    /// Wait-budget window.
    #[inline]
    pub fn wait(self) -> WaitData {
        WaitData::from_bits(((self.0 >> SHIFT_WAIT) & MASK_WAIT) as u8)
    }

    #[inline]
    pub fn with_wait(self, wait: WaitData) -> Self {
        let cleared = self.0 & !(MASK_WAIT << SHIFT_WAIT);
        Self(cleared | ((wait.bits() as u32 & MASK_WAIT) << SHIFT_WAIT))
    }

    /// Flow flags.
    #[inline]
    pub fn flags(self) -> FlowFlags {
        FlowFlags::from_bits_truncate(((self.0 >> SHIFT_FLAGS) & MASK_FLAGS) as u8)
    }

    #[inline]
    pub fn with_flags(self, flags: FlowFlags) -> Self {
        let cleared = self.0 & !(MASK_FLAGS << SHIFT_FLAGS);
        Self(cleared | ((flags.bits() as u32 & MASK_FLAGS) << SHIFT_FLAGS))
    }
}

/// Per-task scheduler context.
///
/// Field groups follow the write pattern: the stop-path group first
/// (slice, packed word, deficit, runtime average), then the run-path
/// timestamps, then the wake side channel and RNG. All fields use
/// relaxed atomics; the framework serializes the callbacks that matter
/// per task, the atomics only rule out torn access from cross-CPU
/// readers on the wake path.
#[derive(Debug)]
pub struct TaskContext {
    /// Pre-computed slice for the next run (ns).
    pub next_slice_ns: AtomicU32,
    /// Packed status word, see [`PackedInfo`].
    pub packed: AtomicU32,
    /// Remaining deficit credit (us).
    pub deficit_us: AtomicU16,
    /// EMA of run length (us), capped at u16::MAX.
    pub avg_runtime_us: AtomicU16,
    /// Timestamp of the last run start (truncated ns, wraps ~4.2s).
    pub last_run_at: AtomicU32,
    /// Timestamp of the last wake; zero means no wake is pending.
    pub last_wake_ts: AtomicU32,
    /// Direct-dispatch mailbox chosen by the waker; zero means none.
    pub target_dsq: AtomicU32,
    /// XorShift32 state for starvation jitter, self-seeded.
    pub rng_state: AtomicU32,
}

impl TaskContext {
    /// Context for a task just joining the scheduler class.
    ///
    /// The new-flow bonus is absorbed here: the deficit starts at
    /// `(quantum + bonus) >> 10` microseconds, so the first runs get
    /// longer slices with no special-casing later.
    pub fn fresh(quantum_ns: u64, initial_deficit_us: u16) -> Self {
        Self {
            next_slice_ns: AtomicU32::new(quantum_ns as u32),
            packed: AtomicU32::new(PackedInfo::initial().bits()),
            deficit_us: AtomicU16::new(initial_deficit_us),
            avg_runtime_us: AtomicU16::new(0),
            last_run_at: AtomicU32::new(0),
            last_wake_ts: AtomicU32::new(0),
            target_dsq: AtomicU32::new(0),
            rng_state: AtomicU32::new(0),
        }
    }

    /// Load the packed word.
    #[inline]
    pub fn packed_info(&self) -> PackedInfo {
        PackedInfo::from_bits(self.packed.load(Ordering::Relaxed))
    }

    /// Store the packed word only when it changed, keeping the cache
    /// line clean across the common no-op case.
    #[inline]
    pub fn store_packed_if_changed(&self, old: PackedInfo, new: PackedInfo) {
        if old != new {
            self.packed.store(new.bits(), Ordering::Relaxed);
        }
    }

    /// Advance the per-task XorShift32 state and return the new value.
    ///
    /// Wait-free and register-only once seeded. The seed comes from the
    /// caller's clock reading; the state is forced odd so it can never
    /// collapse to the zero fixpoint.
    #[inline]
    pub fn next_rand(&self, seed: u32) -> u32 {
        let mut x = self.rng_state.load(Ordering::Relaxed);
        if x == 0 {
            x = seed | 1;
        }
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng_state.store(x, Ordering::Relaxed);
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_packed_word() {
        let info = PackedInfo::initial();
        assert_eq!(info.score(), 50);
        assert_eq!(info.tier(), Tier::Interactive);
        assert_eq!(info.flags(), FlowFlags::NEW);
        assert_eq!(info.wait(), WaitData::reset());
    }

    #[test]
    fn test_packed_fields_are_independent() {
        let info = PackedInfo::initial()
            .with_score(93)
            .with_tier(Tier::CriticalLatency)
            .with_wait(WaitData::from_bits(0x35));
        assert_eq!(info.score(), 93);
        assert_eq!(info.tier(), Tier::CriticalLatency);
        assert_eq!(info.wait().violations(), 3);
        assert_eq!(info.wait().checks(), 5);
        assert_eq!(info.flags(), FlowFlags::NEW);
    }

    #[test]
    fn test_tier_from_index_clamps_garbage() {
        assert_eq!(Tier::from_index(6), Tier::Background);
        assert_eq!(Tier::from_index(7), Tier::Interactive);
        assert_eq!(Tier::from_index(200), Tier::Interactive);
    }

    #[test]
    fn test_wait_data_saturates() {
        let mut wait = WaitData::reset();
        for _ in 0..40 {
            wait = wait.record(true);
        }
        assert_eq!(wait.checks(), 15);
        assert_eq!(wait.violations(), 15);
    }

    #[test]
    fn test_wait_data_counts_violations_separately() {
        let wait = WaitData::reset().record(false).record(true).record(false);
        assert_eq!(wait.checks(), 3);
        assert_eq!(wait.violations(), 1);
    }

    #[test]
    fn test_fresh_context_deficit() {
        let ctx = TaskContext::fresh(4_000_000, 11_718);
        assert_eq!(ctx.deficit_us.load(Ordering::Relaxed), 11_718);
        assert_eq!(ctx.next_slice_ns.load(Ordering::Relaxed), 4_000_000);
        assert_eq!(ctx.last_wake_ts.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_rng_never_sticks_at_zero() {
        let ctx = TaskContext::fresh(1, 1);
        let a = ctx.next_rand(0);
        let b = ctx.next_rand(0);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_store_packed_skips_unchanged() {
        let ctx = TaskContext::fresh(1, 1);
        let info = ctx.packed_info();
        ctx.store_packed_if_changed(info, info);
        assert_eq!(ctx.packed_info(), info);
        let bumped = info.with_score(60);
        ctx.store_packed_if_changed(info, bumped);
        assert_eq!(ctx.packed_info().score(), 60);
    }
}
