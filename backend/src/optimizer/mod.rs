//! Dispatch optimizers
//!
//! Each optimizer computes the cash-flow maximizing schedule of one asset
//! for a delivery day and, after clearing, re-optimizes against the
//! committed schedule (post-market dispatch).
//!
//! - **thermal**: unit commitment with ramp, min run and min stop limits
//! - **storage**: volume-state dispatch with asymmetric efficiencies
//! - **scenarios**: price-shape scenarios for storage bidding
//!
//! # Critical Invariants
//!
//! 1. Every call builds a fresh model; optimizers hold no mutable state
//! 2. An infeasible model is an error, never a zero schedule
//! 3. Missing forecast data is an error, never a zero price

pub mod scenarios;
pub mod storage;
pub mod thermal;

pub use scenarios::PriceScenario;
pub use storage::{ScenarioDispatch, StorageOptimizer};
pub use thermal::{PreventedStart, StepDispatch, StepResults, UnitCommitmentOptimizer};

use crate::models::asset::AssetState;
use crate::models::forecast::{ForecastError, PriceForecast};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OptimizationError {
    #[error("{asset_id}: no feasible schedule: {reason}")]
    Infeasible { asset_id: String, reason: String },

    #[error("{asset_id}: forecast unavailable: {source}")]
    MissingForecast {
        asset_id: String,
        #[source]
        source: ForecastError,
    },

    #[error("{asset_id}: {series} has {actual} hours, expected {expected}")]
    Length {
        asset_id: String,
        series: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Cash-flow breakdown of a schedule (€)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CashFlow {
    /// Income from energy sold
    pub revenue: f64,
    /// Cost of energy bought (storage charging)
    pub purchase: f64,
    pub fuel: f64,
    pub emission: f64,
    pub start: f64,
    pub profit: f64,
}

impl CashFlow {
    pub(crate) fn settle(mut self) -> Self {
        self.profit = self.revenue - self.purchase - self.fuel - self.emission - self.start;
        self
    }
}

/// Optimized schedule of one asset
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Hourly output (MW); negative for storage charging
    pub power: Vec<f64>,
    pub cash_flow: CashFlow,
    /// Model objective including deviation penalties
    pub objective: f64,
    /// Physical state after the delivery day
    pub end_state: AssetState,
}

impl Dispatch {
    pub fn is_idle(&self, tolerance: f64) -> bool {
        self.power.iter().all(|p| p.abs() <= tolerance)
    }
}

/// Seam between agents and the asset models
pub trait DispatchOptimizer {
    /// Cash-flow maximizing schedule for `date` at forecast prices
    fn optimize(&self, date: NaiveDate, forecast: &PriceForecast) -> Result<Dispatch, OptimizationError>;

    /// Schedule tracking `committed` as closely as the technical limits allow
    ///
    /// `prices` overrides the forecast power price (cleared prices after the
    /// auction). Deviations cost `max(2·|price|, floor)` per MWh.
    fn optimize_post_market(
        &self,
        committed: &[f64],
        prices: Option<&[f64]>,
        forecast: &PriceForecast,
    ) -> Result<Dispatch, OptimizationError>;
}

/// Per-hour price of deviating from a commitment
pub(crate) fn deviation_penalty(prices: &[f64], floor: f64) -> Vec<f64> {
    prices.iter().map(|p| (2.0 * p.abs()).max(floor)).collect()
}

/// Evenly spaced grid on `[lo, hi]` merged with `extra` points
///
/// Grid points within `tolerance` of an extra point are replaced by it, so
/// extra values appear in the grid bit-for-bit.
pub(crate) fn merged_grid(lo: f64, hi: f64, intervals: usize, extra: &[f64], tolerance: f64) -> Vec<f64> {
    let mut points: Vec<f64> = Vec::new();
    for &value in extra {
        if points.iter().all(|p| (p - value).abs() > tolerance) {
            points.push(value);
        }
    }
    let step = (hi - lo) / intervals.max(1) as f64;
    for i in 0..=intervals.max(1) {
        let value = if i == intervals.max(1) { hi } else { lo + step * i as f64 };
        if points.iter().all(|p| (p - value).abs() > tolerance) {
            points.push(value);
        }
    }
    points.sort_by(|a, b| a.total_cmp(b));
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merged_grid_keeps_extra_exactly() {
        let extra = 100.0 + 1e-9;
        let grid = merged_grid(100.0, 300.0, 4, &[extra], 1e-6);
        assert_eq!(grid.len(), 5);
        assert_eq!(grid[0], extra);
        assert_eq!(grid[4], 300.0);
    }

    #[test]
    fn test_deviation_penalty_floor() {
        let penalty = deviation_penalty(&[0.0, -600.0, 100.0], 1000.0);
        assert_eq!(penalty, vec![1000.0, 1200.0, 1000.0]);
    }
}
