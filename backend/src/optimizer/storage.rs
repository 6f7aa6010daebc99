//! Storage dispatch
//!
//! The state variable is the stored volume `V`, restricted to a grid on
//! `[V_min, V_max]` that always contains the current volume and the
//! terminal target. Moving from `V` to `V'` within one hour means
//!
//! ```text
//! charge:    P = −(V' − V) / η⁺      with (V' − V) / η⁺ ≤ P⁺_max
//! discharge: P =  (V − V') · η⁻      with (V − V') · η⁻ ≤ P⁻_max
//! ```
//!
//! The end-of-day volume is pinned to a share of capacity so that no
//! schedule profits from emptying the reservoir at the horizon.

use super::scenarios::PriceScenario;
use super::{deviation_penalty, merged_grid, CashFlow, Dispatch, DispatchOptimizer, OptimizationError};
use crate::core::time::HOURS_PER_DAY;
use crate::config::OptimizerConfig;
use crate::models::asset::{AssetState, StorageAsset, StorageState};
use crate::models::forecast::PriceForecast;
use chrono::NaiveDate;
use tracing::debug;

/// Schedule for one price-shape scenario
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioDispatch {
    pub scenario: PriceScenario,
    /// Reshaped power prices the scenario was solved with
    pub prices: Vec<f64>,
    pub dispatch: Dispatch,
}

pub struct StorageOptimizer<'a> {
    asset: &'a StorageAsset,
    config: &'a OptimizerConfig,
}

impl<'a> StorageOptimizer<'a> {
    pub fn new(asset: &'a StorageAsset, config: &'a OptimizerConfig) -> Self {
        Self { asset, config }
    }

    /// Volume the reservoir must hold at the end of the day
    pub fn terminal_volume(&self) -> f64 {
        let params = &self.asset.params;
        (params.capacity * self.config.storage_terminal_share).clamp(params.min_volume, params.capacity)
    }

    /// Solve against one day of power prices
    pub fn solve_prices(&self, prices: &[f64]) -> Result<Dispatch, OptimizationError> {
        self.solve(prices, None)
    }

    /// One schedule per price-shape scenario, in [`PriceScenario::ALL`] order
    pub fn optimize_scenarios(&self, forecast: &PriceForecast) -> Result<Vec<ScenarioDispatch>, OptimizationError> {
        let prices = self.day_prices(forecast)?;
        PriceScenario::ALL
            .iter()
            .map(|&scenario| {
                let shaped = scenario.apply(&prices, forecast.demand(), self.config.scenario_shift_hours);
                let dispatch = self.solve(&shaped, None)?;
                Ok(ScenarioDispatch {
                    scenario,
                    prices: shaped,
                    dispatch,
                })
            })
            .collect()
    }

    fn day_prices(&self, forecast: &PriceForecast) -> Result<Vec<f64>, OptimizationError> {
        forecast
            .power(1)
            .map_err(|source| OptimizationError::MissingForecast {
                asset_id: self.asset.id.clone(),
                source,
            })
    }

    fn infeasible(&self, reason: String) -> OptimizationError {
        OptimizationError::Infeasible {
            asset_id: self.asset.id.clone(),
            reason,
        }
    }

    fn check_hours(&self, series: &'static str, values: &[f64]) -> Result<(), OptimizationError> {
        if values.len() != HOURS_PER_DAY {
            return Err(OptimizationError::Length {
                asset_id: self.asset.id.clone(),
                series,
                expected: HOURS_PER_DAY,
                actual: values.len(),
            });
        }
        Ok(())
    }

    /// Grid power of moving from `from` to `to` in one hour, `None` when the
    /// power limits forbid it
    fn transition_power(&self, from: f64, to: f64) -> Option<f64> {
        let params = &self.asset.params;
        let tolerance = self.config.tolerance;
        if to > from {
            let consumed = (to - from) / params.charge_efficiency;
            (consumed <= params.charge_power + tolerance).then_some(-consumed)
        } else if to < from {
            let injected = (from - to) * params.discharge_efficiency;
            (injected <= params.discharge_power + tolerance).then_some(injected)
        } else {
            Some(0.0)
        }
    }

    fn solve(&self, prices: &[f64], committed: Option<&[f64]>) -> Result<Dispatch, OptimizationError> {
        let params = &self.asset.params;
        let tolerance = self.config.tolerance;
        let start = self.asset.state.volume;
        if start < params.min_volume - tolerance || start > params.capacity + tolerance {
            return Err(self.infeasible(format!(
                "volume {} outside [{}, {}]",
                start, params.min_volume, params.capacity
            )));
        }

        let terminal = self.terminal_volume();
        let volumes = merged_grid(
            params.min_volume,
            params.capacity,
            self.config.volume_levels,
            &[start, terminal],
            tolerance,
        );
        let n = volumes.len();
        let position = |v: f64| volumes.iter().position(|&x| (x - v).abs() <= tolerance);
        let (Some(initial), Some(target)) = (position(start), position(terminal)) else {
            return Err(self.infeasible("volume grid lost a pinned volume".to_string()));
        };

        // grid power of every transition, shared by all hours
        let moves: Vec<Vec<Option<f64>>> = volumes
            .iter()
            .map(|&from| volumes.iter().map(|&to| self.transition_power(from, to)).collect())
            .collect();

        let penalty = deviation_penalty(prices, self.config.deviation_penalty_floor);
        let mut value = vec![f64::NEG_INFINITY; n];
        value[initial] = 0.0;
        let mut back: Vec<Vec<usize>> = Vec::with_capacity(prices.len());

        for (t, &price) in prices.iter().enumerate() {
            let mut next = vec![f64::NEG_INFINITY; n];
            let mut from = vec![usize::MAX; n];
            for (i, &v) in value.iter().enumerate() {
                if v == f64::NEG_INFINITY {
                    continue;
                }
                for (j, power) in moves[i].iter().enumerate() {
                    let Some(power) = *power else { continue };
                    let deviation = committed.map_or(0.0, |c| penalty[t] * (c[t] - power).abs());
                    let candidate = v + power * price - deviation;
                    if candidate > next[j] {
                        next[j] = candidate;
                        from[j] = i;
                    }
                }
            }
            back.push(from);
            value = next;
        }

        if value[target] == f64::NEG_INFINITY {
            return Err(self.infeasible(format!(
                "terminal volume {} unreachable from {} within power limits",
                terminal, start
            )));
        }

        let mut power = vec![0.0; prices.len()];
        let mut state = target;
        for t in (0..prices.len()).rev() {
            let previous = back[t][state];
            power[t] = moves[previous][state].unwrap_or(0.0);
            state = previous;
        }

        let mut cash_flow = CashFlow::default();
        for (&p, &price) in power.iter().zip(prices) {
            if p >= 0.0 {
                cash_flow.revenue += p * price;
            } else {
                cash_flow.purchase -= p * price;
            }
        }

        Ok(Dispatch {
            power,
            cash_flow: cash_flow.settle(),
            objective: value[target],
            end_state: AssetState::Storage(StorageState {
                volume: volumes[target],
            }),
        })
    }
}

impl DispatchOptimizer for StorageOptimizer<'_> {
    fn optimize(&self, date: NaiveDate, forecast: &PriceForecast) -> Result<Dispatch, OptimizationError> {
        let dispatch = self.solve(&self.day_prices(forecast)?, None)?;
        debug!(asset = %self.asset.id, %date, profit = dispatch.cash_flow.profit, "optimized");
        Ok(dispatch)
    }

    fn optimize_post_market(
        &self,
        committed: &[f64],
        prices: Option<&[f64]>,
        forecast: &PriceForecast,
    ) -> Result<Dispatch, OptimizationError> {
        self.check_hours("committed power", committed)?;
        let prices = match prices {
            Some(cleared) => {
                self.check_hours("cleared prices", cleared)?;
                cleared.to_vec()
            }
            None => self.day_prices(forecast)?,
        };
        self.solve(&prices, Some(committed))
    }
}
