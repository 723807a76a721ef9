//! Deficit accounting and slice precomputation
//!
//! The credit scheme is deficit round robin with a new-flow bonus: a
//! task starts with `(quantum + bonus)` worth of credit and burns it
//! down as it runs. The next slice is computed at stop time from the
//! remaining credit, so the wake and enqueue paths never multiply;
//! they load one precomputed u32.
//!
//! Microseconds here are the cheap kind: nanoseconds shifted by 10.

use crate::config::TierTable;
use crate::task::Tier;

/// Starting deficit for a new task, in shifted microseconds.
#[inline]
pub fn initial_deficit_us(quantum_ns: u64, new_flow_bonus_ns: u64) -> u16 {
    ((quantum_ns + new_flow_bonus_ns) >> 10).min(u16::MAX as u64) as u16
}

/// Burn one run's worth of credit. Saturates at zero; credit is never
/// granted back, so the deficit can only shrink from its initial value.
#[inline]
pub fn drain_deficit(old_deficit_us: u16, runtime_ns: u64) -> u16 {
    let runtime_us = runtime_ns >> 10;
    if runtime_us < old_deficit_us as u64 {
        old_deficit_us - runtime_us as u16
    } else {
        0
    }
}

/// Slice for the next run: the larger of remaining credit and the
/// quantum, scaled by the tier multiplier.
#[inline]
pub fn next_slice_ns(deficit_us: u16, tier: Tier, quantum_ns: u64, tiers: &TierTable) -> u32 {
    let deficit_ns = (deficit_us as u64) << 10;
    let base = deficit_ns.max(quantum_ns);
    let scaled = (base * tiers.params(tier).slice_multiplier as u64) >> 10;
    scaled.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUANTUM: u64 = 4_000_000;

    #[test]
    fn test_initial_deficit_absorbs_bonus() {
        assert_eq!(initial_deficit_us(4_000_000, 8_000_000), 11_718);
    }

    #[test]
    fn test_drain_subtracts_runtime() {
        assert_eq!(drain_deficit(11_718, 50_000), 11_718 - 48);
    }

    #[test]
    fn test_drain_saturates_at_zero() {
        assert_eq!(drain_deficit(10, 5_000_000), 0);
        assert_eq!(drain_deficit(0, 1), 0);
    }

    #[test]
    fn test_deficit_never_regrows() {
        let initial = initial_deficit_us(QUANTUM, 8_000_000);
        let mut deficit = initial;
        for runtime in [0u64, 1_000, 500_000, 10_000_000, 3] {
            deficit = drain_deficit(deficit, runtime);
            assert!(deficit <= initial);
        }
    }

    #[test]
    fn test_slice_uses_deficit_while_credit_remains() {
        let tiers = TierTable::gaming_profile();
        // 11_670us of credit outweighs the 4ms quantum; Interactive
        // scales it by 1.1x.
        let slice = next_slice_ns(11_670, Tier::Interactive, QUANTUM, &tiers);
        assert_eq!(slice, ((11_670u64 << 10) * 1126 >> 10) as u32);
    }

    #[test]
    fn test_slice_floors_at_quantum_when_credit_spent() {
        let tiers = TierTable::gaming_profile();
        let slice = next_slice_ns(0, Tier::Gaming, QUANTUM, &tiers);
        assert_eq!(slice, QUANTUM as u32);
    }

    #[test]
    fn test_slice_multiplier_shrinks_latency_tiers() {
        let tiers = TierTable::gaming_profile();
        let hot = next_slice_ns(0, Tier::CriticalLatency, QUANTUM, &tiers);
        let bulk = next_slice_ns(0, Tier::Background, QUANTUM, &tiers);
        assert_eq!(hot, (QUANTUM * 717 >> 10) as u32);
        assert_eq!(bulk, (QUANTUM * 1331 >> 10) as u32);
        assert!(hot < QUANTUM as u32 && (QUANTUM as u32) < bulk);
    }
}
