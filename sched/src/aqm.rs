//! Wait-budget active queue management
//!
//! Each tier promises a wake-to-run latency; a task whose tier keeps
//! missing that promise does not belong there. Every completed
//! wake-to-run cycle bumps the `checks` counter and, when the observed
//! wait exceeded the tier budget, the `violations` counter. Once ten
//! cycles have been observed the window closes: three or more
//! violations (a >=30% miss rate) cost the task ten points of sparse
//! score, which the next stop translates into a lower tier. Either way
//! the window restarts from zero.
//!
//! The thresholds are deliberate: one anomalous wait can never demote,
//! a sustained miss rate drops roughly a tier every ten runs.

use crate::task::{PackedInfo, Tier, WaitData};

/// Cycles per demotion window.
pub const WINDOW_CHECKS: u8 = 10;

/// Violations within a window that trigger demotion.
pub const WINDOW_VIOLATIONS: u8 = 3;

/// Sparse-score penalty applied on demotion.
pub const SCORE_PENALTY: u8 = 10;

/// Waits longer than this mean the task slept through something big
/// (two frames at 60Hz); its runtime history is halved so it can
/// re-qualify quickly when activity resumes.
pub const LONG_SLEEP_NS: u64 = 33_000_000;

/// Result of folding one wake-to-run observation into the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AqmVerdict {
    /// New wait window to write back.
    pub wait: WaitData,
    /// New sparse score to write back.
    pub score: u8,
    /// True when the window closed with a demotion.
    pub demoted: bool,
}

/// Fold one observed wait into the task's window.
///
/// A `budget_ns` of zero disables violation tracking for the tier; the
/// Background tier cannot be demoted regardless.
pub fn observe_wait(packed: PackedInfo, tier: Tier, wait_ns: u64, budget_ns: u64) -> AqmVerdict {
    let violated = budget_ns > 0 && wait_ns > budget_ns;
    let recorded = packed.wait().record(violated);

    if recorded.checks() >= WINDOW_CHECKS && tier < Tier::Background {
        if recorded.violations() >= WINDOW_VIOLATIONS {
            let score = packed.score().saturating_sub(SCORE_PENALTY);
            AqmVerdict {
                wait: WaitData::reset(),
                score,
                demoted: true,
            }
        } else {
            AqmVerdict {
                wait: WaitData::reset(),
                score: packed.score(),
                demoted: false,
            }
        }
    } else {
        AqmVerdict {
            wait: recorded,
            score: packed.score(),
            demoted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed_with(score: u8, wait: WaitData) -> PackedInfo {
        PackedInfo::initial().with_score(score).with_wait(wait)
    }

    fn wait_after(cycles: &[bool]) -> WaitData {
        let mut w = WaitData::reset();
        for &v in cycles {
            w = w.record(v);
        }
        w
    }

    #[test]
    fn test_single_violation_never_demotes() {
        let packed = packed_with(80, WaitData::reset());
        let verdict = observe_wait(packed, Tier::Gaming, 10_000_000, 4_000_000);
        assert!(!verdict.demoted);
        assert_eq!(verdict.score, 80);
        assert_eq!(verdict.wait.checks(), 1);
        assert_eq!(verdict.wait.violations(), 1);
    }

    #[test]
    fn test_window_closes_with_demotion() {
        // 9 cycles observed, 2 violations so far; a third violation on
        // the tenth cycle crosses the 30% line.
        let wait = wait_after(&[true, true, false, false, false, false, false, false, false]);
        let packed = packed_with(80, wait);
        let verdict = observe_wait(packed, Tier::Gaming, 10_000_000, 4_000_000);
        assert!(verdict.demoted);
        assert_eq!(verdict.score, 70);
        assert_eq!(verdict.wait, WaitData::reset());
    }

    #[test]
    fn test_clean_window_resets_without_penalty() {
        let wait = wait_after(&[true, false, false, false, false, false, false, false, false]);
        let packed = packed_with(80, wait);
        let verdict = observe_wait(packed, Tier::Gaming, 1_000, 4_000_000);
        assert!(!verdict.demoted);
        assert_eq!(verdict.score, 80);
        assert_eq!(verdict.wait, WaitData::reset());
    }

    #[test]
    fn test_background_is_exempt() {
        let wait = wait_after(&[true; 9]);
        let packed = packed_with(20, wait);
        let verdict = observe_wait(packed, Tier::Background, u64::MAX / 2, 1);
        assert!(!verdict.demoted);
        // No window reset either: the counters just saturate.
        assert_eq!(verdict.wait.checks(), 10);
    }

    #[test]
    fn test_zero_budget_never_violates() {
        let packed = packed_with(80, WaitData::reset());
        let verdict = observe_wait(packed, Tier::Gaming, u64::MAX / 2, 0);
        assert_eq!(verdict.wait.violations(), 0);
        assert_eq!(verdict.wait.checks(), 1);
    }

    #[test]
    fn test_penalty_floors_at_zero() {
        let wait = wait_after(&[true; 9]);
        let packed = packed_with(5, wait);
        let verdict = observe_wait(packed, Tier::Batch, 10_000_000, 1_000);
        assert!(verdict.demoted);
        assert_eq!(verdict.score, 0);
    }
}
