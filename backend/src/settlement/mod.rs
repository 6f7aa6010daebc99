//! Post-market settlement
//!
//! After clearing every asset re-optimizes against its accepted volumes:
//! the same technical model is solved with the committed schedule as a
//! target and deviations penalized, the realized schedule is paid at the
//! cleared prices and the resulting physical state becomes the initial
//! state of the next day.
//!
//! # Critical Invariants
//!
//! 1. Committing an asset's own optimum reproduces it exactly
//! 2. An asset whose model is infeasible dispatches zero, never a guess
//! 3. Hours without asks or bids are excluded from the cash flow
//!
//! # Example
//!
//! ```
//! use chrono::NaiveDate;
//! use market_simulator_core_rs::config::OptimizerConfig;
//! use market_simulator_core_rs::models::asset::{Asset, StorageAsset, StorageParams, StorageState};
//! use market_simulator_core_rs::models::forecast::{DayForecast, PriceForecast};
//! use market_simulator_core_rs::settlement::SettlementPostProcessor;
//!
//! let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
//! let params = StorageParams {
//!     capacity: 100.0,
//!     min_volume: 0.0,
//!     charge_power: 10.0,
//!     discharge_power: 10.0,
//!     charge_efficiency: 0.9,
//!     discharge_efficiency: 0.9,
//! };
//! let mut asset = Asset::Storage(StorageAsset::new("STO", params, StorageState { volume: 50.0 }).unwrap());
//! let forecast = PriceForecast::new(date, vec![DayForecast::flat(40.0, 0.0, 0.0)]).unwrap();
//!
//! let config = OptimizerConfig::default();
//! let settlement = SettlementPostProcessor::new(&config)
//!     .settle(&mut asset, &[0.0; 24], &[40.0; 24], &Default::default(), &forecast)
//!     .unwrap();
//! assert!(settlement.skipped.is_none());
//! assert!(settlement.realized.iter().all(|&p| p == 0.0));
//! ```

use crate::config::OptimizerConfig;
use crate::core::time::HOURS_PER_DAY;
use crate::models::asset::{Asset, AssetError, AssetState, ThermalAsset};
use crate::models::forecast::PriceForecast;
use crate::optimizer::{CashFlow, DispatchOptimizer, OptimizationError, StorageOptimizer, UnitCommitmentOptimizer};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("state update rejected: {0}")]
    State(#[from] AssetError),
}

/// Settled day of one asset
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub agent_id: String,
    /// Accepted volumes per hour (MW), negative for storage charging
    pub committed: Vec<f64>,
    /// Physically dispatched schedule (MW)
    pub realized: Vec<f64>,
    /// Realized cash flow at cleared prices, aborted hours excluded
    pub cash_flow: CashFlow,
    pub aborted_hours: Vec<usize>,
    pub end_state: AssetState,
    /// Why the asset did not dispatch
    pub skipped: Option<OptimizationError>,
}

impl Settlement {
    pub fn committed_volume(&self) -> f64 {
        self.committed.iter().sum()
    }

    pub fn realized_volume(&self) -> f64 {
        self.realized.iter().sum()
    }

    /// Σ |committed − realized| (MWh)
    pub fn deviation(&self) -> f64 {
        self.committed
            .iter()
            .zip(&self.realized)
            .map(|(c, r)| (c - r).abs())
            .sum()
    }
}

pub struct SettlementPostProcessor<'a> {
    config: &'a OptimizerConfig,
}

impl<'a> SettlementPostProcessor<'a> {
    pub fn new(config: &'a OptimizerConfig) -> Self {
        Self { config }
    }

    /// Dispatch `asset` against `committed`, pay it at `prices` and store
    /// the end-of-day state on the asset
    pub fn settle(
        &self,
        asset: &mut Asset,
        committed: &[f64],
        prices: &[f64],
        aborted: &BTreeSet<usize>,
        forecast: &PriceForecast,
    ) -> Result<Settlement, SettlementError> {
        let outcome = match &*asset {
            Asset::Thermal(thermal) => {
                UnitCommitmentOptimizer::new(thermal, self.config).optimize_post_market(committed, Some(prices), forecast)
            }
            Asset::Storage(storage) => {
                StorageOptimizer::new(storage, self.config).optimize_post_market(committed, Some(prices), forecast)
            }
        };

        let (realized, end_state, skipped) = match outcome {
            Ok(dispatch) => (dispatch.power, dispatch.end_state, None),
            Err(error) => {
                warn!(asset = asset.id(), %error, "post-market dispatch infeasible, asset skipped");
                (vec![0.0; HOURS_PER_DAY], self.idle_state(asset), Some(error))
            }
        };

        let cash_flow = self.cash_flow(asset, &realized, prices, aborted, forecast);
        asset.set_state(end_state.clone())?;

        let settlement = Settlement {
            agent_id: asset.id().to_string(),
            committed: committed.to_vec(),
            realized,
            cash_flow,
            aborted_hours: aborted.iter().copied().collect(),
            end_state,
            skipped,
        };
        info!(
            asset = %settlement.agent_id,
            committed = settlement.committed_volume(),
            realized = settlement.realized_volume(),
            deviation = settlement.deviation(),
            profit = settlement.cash_flow.profit,
            "settled"
        );
        Ok(settlement)
    }

    /// State after a day without dispatch
    fn idle_state(&self, asset: &Asset) -> AssetState {
        match asset {
            Asset::Thermal(thermal) => {
                AssetState::Thermal(thermal.state.advance(&[0.0; HOURS_PER_DAY], self.config.tolerance))
            }
            Asset::Storage(storage) => AssetState::Storage(storage.state.clone()),
        }
    }

    fn cash_flow(
        &self,
        asset: &Asset,
        realized: &[f64],
        prices: &[f64],
        aborted: &BTreeSet<usize>,
        forecast: &PriceForecast,
    ) -> CashFlow {
        let mut cash_flow = CashFlow::default();
        let counted = |t: &usize| !aborted.contains(t);
        match asset {
            Asset::Thermal(thermal) => {
                let Some(fuel_costs) = self.fuel_costs(thermal, forecast) else {
                    warn!(asset = %thermal.id, "fuel prices unavailable, fuel cost not settled");
                    return self.revenue_only(realized, prices, aborted);
                };
                let tolerance = self.config.tolerance;
                let mut running = thermal.state.is_on();
                for (t, &p) in realized.iter().enumerate() {
                    let on = p > tolerance;
                    if counted(&t) {
                        cash_flow.revenue += p * prices.get(t).copied().unwrap_or(0.0);
                        let (fuel, emission) = fuel_costs.get(t).copied().unwrap_or((0.0, 0.0));
                        cash_flow.fuel += p * fuel;
                        cash_flow.emission += p * emission;
                        if on && !running {
                            cash_flow.start += thermal.params.start_cost;
                        }
                    }
                    running = on;
                }
                cash_flow.settle()
            }
            Asset::Storage(_) => self.revenue_only(realized, prices, aborted),
        }
    }

    /// Fuel and emission cost per MWh of output, per hour
    fn fuel_costs(&self, thermal: &ThermalAsset, forecast: &PriceForecast) -> Option<Vec<(f64, f64)>> {
        let prices = forecast.thermal_prices(thermal.params.fuel, 1).ok()?;
        let efficiency = thermal.params.efficiency;
        Some(
            prices
                .fuel
                .iter()
                .zip(&prices.co2)
                .map(|(fuel, co2)| (fuel / efficiency, thermal.params.emission_factor * co2 / efficiency))
                .collect(),
        )
    }

    fn revenue_only(&self, realized: &[f64], prices: &[f64], aborted: &BTreeSet<usize>) -> CashFlow {
        let mut cash_flow = CashFlow::default();
        for (t, (&p, &price)) in realized.iter().zip(prices).enumerate() {
            if aborted.contains(&t) {
                continue;
            }
            if p >= 0.0 {
                cash_flow.revenue += p * price;
            } else {
                cash_flow.purchase -= p * price;
            }
        }
        cash_flow.settle()
    }
}
