//! Multiplier values and the growth curve
//!
//! Multipliers are fixed-point hundredths so that two-decimal rounding and
//! payout flooring are exact integer operations.

use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

const HUNDREDTHS: u64 = 100;

/// A payout multiplier with two decimal places (`2.50x` is stored as `250`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Multiplier(u64);

impl Multiplier {
    /// The starting multiplier of every round
    pub const ONE: Multiplier = Multiplier(HUNDREDTHS);

    pub const MAX: Multiplier = Multiplier(u64::MAX);

    pub const fn from_hundredths(hundredths: u64) -> Self {
        Self(hundredths)
    }

    pub const fn hundredths(self) -> u64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / HUNDREDTHS as f64
    }

    /// Round a decimal to the nearest hundredth
    pub fn from_f64_rounded(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        Some(Self((value * HUNDREDTHS as f64).round() as u64))
    }

    /// Truncate a decimal to the hundredth below it
    pub fn from_f64_floor(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        Some(Self((value * HUNDREDTHS as f64).floor() as u64))
    }

    /// `floor(amount × multiplier)`, saturating at `u64::MAX`
    pub fn payout(self, amount: u64) -> u64 {
        let win = amount as u128 * self.0 as u128 / HUNDREDTHS as u128;
        u64::try_from(win).unwrap_or(u64::MAX)
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / HUNDREDTHS, self.0 % HUNDREDTHS)
    }
}

impl From<Multiplier> for f64 {
    fn from(m: Multiplier) -> Self {
        m.as_f64()
    }
}

impl TryFrom<f64> for Multiplier {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        match Multiplier::from_f64_rounded(value) {
            Some(m) if m >= Multiplier::ONE => Ok(m),
            _ => Err(format!("multiplier must be a finite value >= 1.00, got {}", value)),
        }
    }
}

/// Exponential growth curve: `multiplier = round2(e^(k × seconds))`.
///
/// Pure and deterministic, so the scheduler can always recompute the
/// multiplier from the round start instead of accumulating per-tick state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiplierCurve {
    growth_rate: f64,
}

impl MultiplierCurve {
    pub const DEFAULT_GROWTH_RATE: f64 = 0.06;

    pub fn new(growth_rate: f64) -> Self {
        Self { growth_rate }
    }

    pub fn growth_rate(&self) -> f64 {
        self.growth_rate
    }

    pub fn multiplier_at(&self, elapsed: Duration) -> Multiplier {
        let value = (self.growth_rate * elapsed.as_secs_f64()).exp();
        // float-to-int casts saturate, so very long rounds pin at Multiplier::MAX
        let hundredths = (value * HUNDREDTHS as f64).round() as u64;
        Multiplier(hundredths.max(HUNDREDTHS))
    }

    /// Earliest elapsed time at which `multiplier_at` reaches `target`
    pub fn time_to_reach(&self, target: Multiplier) -> Duration {
        if target <= Multiplier::ONE {
            return Duration::ZERO;
        }
        // round() reaches N hundredths once the raw value is N - 0.5
        let threshold = (target.0 as f64 - 0.5) / HUNDREDTHS as f64;
        let seconds = threshold.ln() / self.growth_rate;
        if seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for MultiplierCurve {
    fn default() -> Self {
        Self::new(Self::DEFAULT_GROWTH_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curve_starts_at_one() {
        let curve = MultiplierCurve::default();
        assert_eq!(curve.multiplier_at(Duration::ZERO), Multiplier::ONE);
    }

    #[test]
    fn test_curve_is_monotonic() {
        let curve = MultiplierCurve::default();
        let mut previous = Multiplier::ONE;
        for ms in (0..120_000u64).step_by(37) {
            let current = curve.multiplier_at(Duration::from_millis(ms));
            assert!(current >= previous, "curve decreased at {}ms", ms);
            previous = current;
        }
        assert!(previous > Multiplier::from_hundredths(1_000));
    }

    #[test]
    fn test_curve_is_deterministic() {
        let curve = MultiplierCurve::new(0.1);
        let elapsed = Duration::from_millis(8_765);
        assert_eq!(curve.multiplier_at(elapsed), curve.multiplier_at(elapsed));
    }

    #[test]
    fn test_time_to_reach_is_first_instant() {
        let curve = MultiplierCurve::default();
        for hundredths in [101u64, 150, 200, 250, 1_000, 12_345] {
            let target = Multiplier::from_hundredths(hundredths);
            let at = curve.time_to_reach(target);
            let after = curve.multiplier_at(at + Duration::from_millis(1));
            let before = curve.multiplier_at(at.saturating_sub(Duration::from_millis(1)));
            assert!(after >= target, "{} not reached by {:?}", target, at);
            assert!(before < target, "{} reached before {:?}", target, at);
        }
        assert_eq!(curve.time_to_reach(Multiplier::ONE), Duration::ZERO);
    }

    #[test]
    fn test_payout_floors() {
        let m = Multiplier::from_hundredths(199);
        assert_eq!(m.payout(100), 199);
        assert_eq!(m.payout(33), 65); // 65.67 floors
        assert_eq!(Multiplier::from_hundredths(200).payout(100), 200);
    }

    #[test]
    fn test_display_and_serde() {
        let m = Multiplier::from_hundredths(250);
        assert_eq!(m.to_string(), "2.50x");
        assert_eq!(serde_json::to_string(&m).unwrap(), "2.5");
        let parsed: Multiplier = serde_json::from_str("2.5").unwrap();
        assert_eq!(parsed, m);
        assert!(serde_json::from_str::<Multiplier>("0.5").is_err());
    }
}
