//! Records-per-trading-day estimator used to size fetch windows.
//!
//! The estimate starts from a seed and only ever moves down within a run:
//! each shortfall shrinks it by at least 10% (unless already at the floor), so
//! subsequent windows cover more calendar time for the same record budget.

use serde::{Deserialize, Serialize};

use crate::config::DensitySeeds;
use crate::domain::Period;
use crate::session::SessionDefinition;

/// Largest multiplier applied on a shortfall.
const SHRINK: f64 = 0.9;
/// Smallest multiplier applied on a single shortfall.
const MAX_DROP: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DensityModel {
    day: f64,
    min1: f64,
    min5: f64,
}

impl Default for DensityModel {
    fn default() -> Self {
        Self {
            day: 1.0,
            min1: 600.0,
            min5: 120.0,
        }
    }
}

impl DensityModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by configured seeds. Seeds below the floor are
    /// raised to it.
    pub fn from_seeds(seeds: &DensitySeeds) -> Self {
        let mut model = Self::default();
        for period in Period::ALL {
            if let Some(seed) = seeds.get(period) {
                *model.slot(period) = seed.max(Self::floor(period));
            }
        }
        model
    }

    pub fn get(&self, period: Period) -> f64 {
        match period {
            Period::Day => self.day,
            Period::Min1 => self.min1,
            Period::Min5 => self.min5,
        }
    }

    fn slot(&mut self, period: Period) -> &mut f64 {
        match period {
            Period::Day => &mut self.day,
            Period::Min1 => &mut self.min1,
            Period::Min5 => &mut self.min5,
        }
    }

    pub fn floor(period: Period) -> f64 {
        match period {
            Period::Day => 0.05,
            Period::Min1 => 1.0,
            Period::Min5 => 0.2,
        }
    }

    /// Lower sub-day estimates to what a session definition can produce.
    /// Never raises an estimate.
    pub fn cap_to_session(&mut self, session: &SessionDefinition) {
        for period in [Period::Min1, Period::Min5] {
            if let Some(bars) = session.bars_per_day(period) {
                let slot = self.slot(period);
                *slot = slot.min(bars.max(Self::floor(period)));
            }
        }
    }

    /// Apply a shortfall observation. Returns the new estimate.
    ///
    /// `new = max(floor, min(current * 0.9, max(observed, current * 0.5)))`
    pub fn record_shortfall(&mut self, period: Period, observed: f64) -> f64 {
        let floor = Self::floor(period);
        let slot = self.slot(period);
        let current = *slot;
        let observed = if observed.is_finite() { observed.max(0.0) } else { 0.0 };
        let candidate = (current * SHRINK).min(observed.max(current * MAX_DROP));
        *slot = candidate.max(floor).min(current);
        *slot
    }

    /// Fold a task's calibrated model back into this one. Only periods the
    /// task lowered below `baseline` (its starting snapshot) are taken, and
    /// then by minimum.
    pub fn fold_calibrated(&mut self, baseline: &DensityModel, calibrated: &DensityModel) {
        for period in Period::ALL {
            let after = calibrated.get(period);
            if after < baseline.get(period) {
                let slot = self.slot(period);
                *slot = slot.min(after);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_seeds() {
        let m = DensityModel::new();
        assert_eq!(m.get(Period::Day), 1.0);
        assert_eq!(m.get(Period::Min1), 600.0);
        assert_eq!(m.get(Period::Min5), 120.0);
    }

    #[test]
    fn three_shortfalls_strictly_decrease() {
        let mut m = DensityModel::new();
        let mut prev = m.get(Period::Min1);
        // Observed density stays far below the estimate every time.
        for _ in 0..3 {
            let next = m.record_shortfall(Period::Min1, 225.0);
            assert!(next < prev, "{next} should be below {prev}");
            prev = next;
        }
    }

    #[test]
    fn shortfall_near_estimate_still_shrinks_ten_percent() {
        let mut m = DensityModel::new();
        let next = m.record_shortfall(Period::Min5, 119.0);
        assert!((next - 108.0).abs() < 1e-9);
    }

    #[test]
    fn single_drop_is_bounded_by_half() {
        let mut m = DensityModel::new();
        let next = m.record_shortfall(Period::Min1, 0.0);
        assert_eq!(next, 300.0);
    }

    #[test]
    fn never_goes_below_floor() {
        let mut m = DensityModel::new();
        for _ in 0..200 {
            m.record_shortfall(Period::Day, 0.0);
        }
        assert_eq!(m.get(Period::Day), DensityModel::floor(Period::Day));
        // At the floor it stays put instead of oscillating.
        let again = m.record_shortfall(Period::Day, 0.0);
        assert_eq!(again, DensityModel::floor(Period::Day));
    }

    #[test]
    fn fold_keeps_minimum_of_calibrated_periods() {
        let mut shared = DensityModel::new();
        let baseline = shared;
        let mut task = baseline;
        task.record_shortfall(Period::Min1, 100.0);
        shared.fold_calibrated(&baseline, &task);
        assert_eq!(shared.get(Period::Min1), 300.0);
        assert_eq!(shared.get(Period::Min5), 120.0);

        // A later task calibrating less aggressively never raises it.
        let baseline = DensityModel::new();
        let mut task = baseline;
        task.record_shortfall(Period::Min1, 590.0);
        shared.fold_calibrated(&baseline, &task);
        assert_eq!(shared.get(Period::Min1), 300.0);
    }

    #[test]
    fn session_cap_does_not_leak_into_shared_model() {
        let mut shared = DensityModel::new();
        let mut baseline = shared;
        baseline.cap_to_session(&SessionDefinition::cn_futures_day());
        let task = baseline;
        shared.fold_calibrated(&baseline, &task);
        assert_eq!(shared, DensityModel::new());

        // A shortfall below the capped seed still folds back.
        let mut task = baseline;
        task.record_shortfall(Period::Min1, 50.0);
        shared.fold_calibrated(&baseline, &task);
        assert_eq!(shared.get(Period::Min1), 112.5);
        assert_eq!(shared.get(Period::Min5), 120.0);
    }

    #[test]
    fn session_caps_but_never_raises() {
        let mut m = DensityModel::new();
        m.cap_to_session(&SessionDefinition::cn_futures_day());
        assert_eq!(m.get(Period::Min1), 225.0);
        assert_eq!(m.get(Period::Min5), 45.0);

        let long = SessionDefinition::parse(&["00:00-23:59"], &[]).unwrap();
        let mut m = DensityModel::new();
        m.cap_to_session(&long);
        assert_eq!(m.get(Period::Min1), 600.0);
    }

    #[test]
    fn seeds_override_defaults() {
        let seeds = DensitySeeds {
            min1: Some(240.0),
            day: Some(0.0),
            ..Default::default()
        };
        let m = DensityModel::from_seeds(&seeds);
        assert_eq!(m.get(Period::Min1), 240.0);
        assert_eq!(m.get(Period::Day), 0.05);
        assert_eq!(m.get(Period::Min5), 120.0);
    }
}
