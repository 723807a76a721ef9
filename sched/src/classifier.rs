//! Sparse-flow classifier
//!
//! Runs once per stop with the task's just-finished run length and
//! produces three pure results: a new runtime average, a new sparse
//! score, and the tier those two imply. Nothing here touches shared
//! state; the caller writes everything back in one packed store.
//!
//! The score moves asymmetrically: +4 for a sparse run, -6 for a bulk
//! run. A single long run therefore demotes quickly, while a task must
//! sustain burstiness to climb. Score 100 with real history is further
//! split by average run length, so that only genuinely tiny tasks
//! (input handlers) reach the top tier.

use crate::task::Tier;

/// Score ceiling; the score domain is closed at [0, 100].
pub const SCORE_MAX: u8 = 100;

/// Score gained per sparse run.
const SPARSE_GAIN: i16 = 4;

/// Score lost per bulk run.
const BULK_LOSS: i16 = 6;

/// Scores below this map to Batch.
const SCORE_BATCH: u8 = 30;

/// Scores below this map to Interactive.
const SCORE_INTERACTIVE: u8 = 50;

/// Scores at or above this count as the sparse (gaming) regime; used
/// for promotion/demotion accounting as well as the tier map.
pub const SCORE_GAMING: u8 = 70;

/// Scores below SCORE_MAX but at or above this map to Critical.
const SCORE_CRITICAL: u8 = 90;

/// Average run length below which a score-100 task is an input-class
/// thread (us).
const LATENCY_GATE_CRITICAL_US: u16 = 50;

/// Average run length below which a score-100 task is a realtime-class
/// thread (us).
const LATENCY_GATE_REALTIME_US: u16 = 500;

/// Exponential moving average of run length with alpha = 1/8.
///
/// The first sample seeds the average directly; afterwards the update
/// is `avg += (meas - avg) >> 3`. Measurements cap at u16::MAX us.
#[inline]
pub fn ema_runtime_us(old_avg_us: u16, runtime_ns: u64) -> u16 {
    let meas_us = (runtime_ns >> 10).min(u16::MAX as u64) as i32;
    if old_avg_us == 0 {
        meas_us as u16
    } else {
        let old = old_avg_us as i32;
        (old + ((meas_us - old) >> 3)) as u16
    }
}

/// Update the sparse score from one run length, clamped to [0, 100].
#[inline]
pub fn sparse_score(old_score: u8, runtime_ns: u64, threshold_ns: u64) -> u8 {
    let step = if runtime_ns < threshold_ns {
        SPARSE_GAIN
    } else {
        -BULK_LOSS
    };
    (old_score as i16 + step).clamp(0, SCORE_MAX as i16) as u8
}

/// Map (score, average run length) to a tier.
#[inline]
pub fn tier_for(score: u8, avg_us: u16) -> Tier {
    if score < SCORE_BATCH {
        Tier::Background
    } else if score < SCORE_INTERACTIVE {
        Tier::Batch
    } else if score < SCORE_GAMING {
        Tier::Interactive
    } else if score < SCORE_CRITICAL {
        Tier::Gaming
    } else if score < SCORE_MAX {
        Tier::Critical
    } else if avg_us > 0 && avg_us < LATENCY_GATE_CRITICAL_US {
        Tier::CriticalLatency
    } else if avg_us > 0 && avg_us < LATENCY_GATE_REALTIME_US {
        Tier::Realtime
    } else {
        // Perfect score but no history yet, or runs too long for the
        // latency gates.
        Tier::Critical
    }
}
