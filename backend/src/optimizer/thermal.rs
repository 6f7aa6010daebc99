//! Unit commitment of thermal power plants
//!
//! The plant is modelled as an hourly on/off state machine:
//!
//! ```text
//!   Off(c) ──start (c ≥ S, P ≤ max(Pmin, ramp_up))──▶ On(1, P)
//!   On(c, P) ──ramp |P' − P| within limits──────────▶ On(c + 1, P')
//!   On(c, P) ──stop (c ≥ R, P ≤ max(Pmin, ramp_down))─▶ Off(1)
//! ```
//!
//! `c` counts consecutive hours in the current status, saturating at the
//! minimum run time `R` (on) or minimum stop time `S` (off). Output while
//! on is restricted to a grid on `[Pmin, Pmax]`, so the model is solved
//! exactly by dynamic programming over `(status, counter, level)`.
//!
//! # Objective
//!
//! ```text
//! max Σ P·price − P/η·(fuel + χ·co2) − start_cost·start − penalty·|committed − P|
//! ```
//!
//! The penalty term only exists in post-market dispatch.
//!
//! # Price steps
//!
//! Bid construction needs the plant's response to perturbed prices, so the
//! same model is solved once per configured [`PriceStep`]. A prevented-start
//! check compares the myopic 24h schedule against a joint 48h solve.

use super::{deviation_penalty, merged_grid, CashFlow, Dispatch, DispatchOptimizer, OptimizationError};
use crate::config::{BiddingConfig, OptimizerConfig, PriceStep};
use crate::core::time::HOURS_PER_DAY;
use crate::models::asset::{AssetState, ThermalAsset, ThermalParams, ThermalState};
use crate::models::forecast::{HourlyPrices, PriceForecast};
use chrono::NaiveDate;
use std::cmp::Ordering;
use tracing::{debug, info, instrument};

// ============================================================================
// Result Types
// ============================================================================

/// Schedule at one perturbed price curve
#[derive(Debug, Clone, PartialEq)]
pub struct StepDispatch {
    pub step: PriceStep,
    /// Power prices the step was solved with
    pub prices: Vec<f64>,
    pub dispatch: Dispatch,
}

/// Hours in which the 24h schedule shuts down although staying on pays off
/// over two days
#[derive(Debug, Clone, PartialEq)]
pub struct PreventedStart {
    pub hours: Vec<usize>,
    /// Price reduction per MWh for the minimum-power block (€/MWh)
    pub discount: f64,
    /// Objective gain of the joint solve over the myopic one (€)
    pub gain: f64,
}

/// Everything the order book builder needs from one optimization run
#[derive(Debug, Clone, PartialEq)]
pub struct StepResults {
    /// Schedule at the unperturbed forecast
    pub base: Dispatch,
    /// Step schedules in ascending price order
    pub steps: Vec<StepDispatch>,
    pub prevented_start: Option<PreventedStart>,
    /// Fuel and emission cost per MWh for each delivery hour
    pub marginal_cost: Vec<f64>,
    /// Unperturbed forecast power prices
    pub forecast_prices: Vec<f64>,
}

// ============================================================================
// Optimizer
// ============================================================================

pub struct UnitCommitmentOptimizer<'a> {
    asset: &'a ThermalAsset,
    config: &'a OptimizerConfig,
}

impl<'a> UnitCommitmentOptimizer<'a> {
    pub fn new(asset: &'a ThermalAsset, config: &'a OptimizerConfig) -> Self {
        Self { asset, config }
    }

    /// Solve against explicit price series of any horizon
    pub fn solve_prices(&self, prices: &HourlyPrices) -> Result<Dispatch, OptimizationError> {
        let model = ThermalModel::build(self.asset, &self.asset.state, prices, None, self.config)?;
        let solution = model.solve()?;
        Ok(model.dispatch(solution))
    }

    /// Solve at every configured price step plus the unperturbed forecast
    #[instrument(skip_all, fields(asset = %self.asset.id, date = %date))]
    pub fn optimize_steps(
        &self,
        date: NaiveDate,
        forecast: &PriceForecast,
        bidding: &BiddingConfig,
    ) -> Result<StepResults, OptimizationError> {
        let prices = self.prices(forecast, 1)?;
        let base = self.solve_prices(&prices)?;

        let mut ordered = bidding.price_steps.clone();
        ordered.sort_by(step_order);

        let mut steps = Vec::with_capacity(ordered.len());
        for step in ordered {
            let curve: Vec<f64> = match step {
                PriceStep::Offset(offset) => prices.power.iter().map(|p| p + offset).collect(),
                PriceStep::RunAtMax => vec![bidding.run_at_max_price; prices.hours()],
            };
            let dispatch = self.solve_prices(&prices.with_power(curve.clone()))?;
            debug!(?step, volume = dispatch.power.iter().sum::<f64>(), "step solved");
            steps.push(StepDispatch {
                step,
                prices: curve,
                dispatch,
            });
        }

        let prevented_start = self.check_prevented_start(date, forecast, &base, bidding)?;
        let marginal_cost = (0..prices.hours())
            .map(|t| self.asset.params.marginal_cost(prices.fuel[t], prices.co2[t]))
            .collect();

        Ok(StepResults {
            base,
            steps,
            prevented_start,
            marginal_cost,
            forecast_prices: prices.power,
        })
    }

    /// Compare the myopic schedule (today, then tomorrow from today's end
    /// state) with a joint two-day solve
    fn check_prevented_start(
        &self,
        date: NaiveDate,
        forecast: &PriceForecast,
        base: &Dispatch,
        bidding: &BiddingConfig,
    ) -> Result<Option<PreventedStart>, OptimizationError> {
        let tolerance = self.config.tolerance;
        let Some(last_on) = base.power.iter().rposition(|&p| p > tolerance) else {
            return Ok(None);
        };
        if last_on + 1 >= HOURS_PER_DAY {
            return Ok(None);
        }
        let hours: Vec<usize> = (last_on + 1..HOURS_PER_DAY).collect();

        if !forecast.has_lookahead() {
            debug!(asset = %self.asset.id, %date, "no lookahead forecast, prevented-start check skipped");
            return Ok(None);
        }
        let two_days = match self.prices(forecast, 2) {
            Ok(prices) => prices,
            Err(error) => {
                debug!(asset = %self.asset.id, %date, %error, "incomplete lookahead forecast, prevented-start check skipped");
                return Ok(None);
            }
        };
        let joint = self.solve_prices(&two_days)?;
        if !hours.iter().all(|&h| joint.power[h] > tolerance) {
            return Ok(None);
        }

        let AssetState::Thermal(end_state) = &base.end_state else {
            return Ok(None);
        };
        let tomorrow = HourlyPrices {
            power: two_days.power[HOURS_PER_DAY..].to_vec(),
            fuel: two_days.fuel[HOURS_PER_DAY..].to_vec(),
            co2: two_days.co2[HOURS_PER_DAY..].to_vec(),
        };
        let follow_up =
            ThermalModel::build(self.asset, end_state, &tomorrow, None, self.config)?.solve()?;

        let myopic = base.objective + follow_up.objective;
        let gain = joint.objective - myopic;
        if gain <= tolerance || gain <= bidding.prevented_start_threshold * myopic.abs() {
            return Ok(None);
        }

        let discount =
            bidding.prevented_start_share * gain / (hours.len() as f64 * self.asset.params.min_power);
        info!(
            asset = %self.asset.id,
            %date,
            first_hour = hours[0],
            gain,
            discount,
            "shutdown prevented"
        );
        Ok(Some(PreventedStart {
            hours,
            discount,
            gain,
        }))
    }

    fn prices(&self, forecast: &PriceForecast, days: usize) -> Result<HourlyPrices, OptimizationError> {
        forecast
            .thermal_prices(self.asset.params.fuel, days)
            .map_err(|source| OptimizationError::MissingForecast {
                asset_id: self.asset.id.clone(),
                source,
            })
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
}

impl DispatchOptimizer for UnitCommitmentOptimizer<'_> {
    fn optimize(&self, date: NaiveDate, forecast: &PriceForecast) -> Result<Dispatch, OptimizationError> {
        let dispatch = self.solve_prices(&self.prices(forecast, 1)?)?;
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
        let mut hourly = self.prices(forecast, 1)?;
        if let Some(cleared) = prices {
            self.check_hours("cleared prices", cleared)?;
            hourly = hourly.with_power(cleared.to_vec());
        }
        let target = Target {
            committed,
            penalty: deviation_penalty(&hourly.power, self.config.deviation_penalty_floor),
        };
        let model = ThermalModel::build(self.asset, &self.asset.state, &hourly, Some(target), self.config)?;
        let solution = model.solve()?;
        Ok(model.dispatch(solution))
    }
}

/// Offsets ascending, run-at-max last
fn step_order(a: &PriceStep, b: &PriceStep) -> Ordering {
    match (a, b) {
        (PriceStep::Offset(x), PriceStep::Offset(y)) => x.total_cmp(y),
        (PriceStep::Offset(_), PriceStep::RunAtMax) => Ordering::Less,
        (PriceStep::RunAtMax, PriceStep::Offset(_)) => Ordering::Greater,
        (PriceStep::RunAtMax, PriceStep::RunAtMax) => Ordering::Equal,
    }
}

// ============================================================================
// Model
// ============================================================================

struct Target<'t> {
    committed: &'t [f64],
    penalty: Vec<f64>,
}

struct Solution {
    power: Vec<f64>,
    starts: Vec<bool>,
    objective: f64,
}

/// One fresh dynamic program per solve
struct ThermalModel<'m> {
    asset_id: &'m str,
    params: &'m ThermalParams,
    state: &'m ThermalState,
    prices: &'m HourlyPrices,
    target: Option<Target<'m>>,
    levels: Vec<f64>,
    cap_run: usize,
    cap_stop: usize,
    tolerance: f64,
}

impl<'m> ThermalModel<'m> {
    fn build(
        asset: &'m ThermalAsset,
        state: &'m ThermalState,
        prices: &'m HourlyPrices,
        target: Option<Target<'m>>,
        config: &OptimizerConfig,
    ) -> Result<Self, OptimizationError> {
        let params = &asset.params;
        let tolerance = config.tolerance;

        let mut extra = Vec::new();
        if state.is_on() {
            extra.push(state.power);
        }
        if let Some(target) = &target {
            extra.extend(
                target
                    .committed
                    .iter()
                    .filter(|&&p| p >= params.min_power - tolerance && p <= params.max_power + tolerance)
                    .map(|p| p.clamp(params.min_power, params.max_power)),
            );
        }

        Ok(Self {
            asset_id: &asset.id,
            params,
            state,
            prices,
            target,
            levels: merged_grid(
                params.min_power,
                params.max_power,
                config.power_levels,
                &extra,
                tolerance,
            ),
            cap_run: params.min_run_time.max(1),
            cap_stop: params.min_stop_time.max(1),
            tolerance,
        })
    }

    fn infeasible(&self, reason: String) -> OptimizationError {
        OptimizationError::Infeasible {
            asset_id: self.asset_id.to_string(),
            reason,
        }
    }

    fn off(&self, counter: usize) -> usize {
        counter - 1
    }

    fn on(&self, counter: usize, level: usize) -> usize {
        self.cap_stop + (counter - 1) * self.levels.len() + level
    }

    /// Level index of an on-state, `None` for off-states
    fn level_of(&self, state: usize) -> Option<usize> {
        state
            .checked_sub(self.cap_stop)
            .map(|offset| offset % self.levels.len())
    }

    fn initial_state(&self) -> Result<usize, OptimizationError> {
        let state = self.state;
        if state.on_hours > 0 && state.off_hours > 0 {
            return Err(self.infeasible(format!(
                "initial state reports {}h on and {}h off",
                state.on_hours, state.off_hours
            )));
        }
        if state.on_hours > 0 {
            if state.power < self.params.min_power - self.tolerance
                || state.power > self.params.max_power + self.tolerance
            {
                return Err(self.infeasible(format!(
                    "running at {} outside [{}, {}]",
                    state.power, self.params.min_power, self.params.max_power
                )));
            }
            let level = self
                .levels
                .iter()
                .position(|&p| (p - state.power).abs() <= self.tolerance)
                .ok_or_else(|| self.infeasible(format!("initial power {} not representable", state.power)))?;
            return Ok(self.on(state.on_hours.min(self.cap_run), level));
        }
        if state.power > self.tolerance {
            return Err(self.infeasible(format!(
                "output {} reported while off",
                state.power
            )));
        }
        // zero counters on both sides: no restriction carried in
        let counter = if state.off_hours == 0 {
            self.cap_stop
        } else {
            state.off_hours.min(self.cap_stop)
        };
        Ok(self.off(counter))
    }

    fn deviation(&self, hour: usize, power: f64) -> f64 {
        match &self.target {
            Some(target) => target.penalty[hour] * (target.committed[hour] - power).abs(),
            None => 0.0,
        }
    }

    fn solve(&self) -> Result<Solution, OptimizationError> {
        let hours = self.prices.hours();
        let n_states = self.cap_stop + self.cap_run * self.levels.len();
        let ramp_up = self.params.ramp_up + self.tolerance;
        let ramp_down = self.params.ramp_down + self.tolerance;
        let start_cap = self.params.min_power.max(self.params.ramp_up) + self.tolerance;
        let stop_cap = self.params.min_power.max(self.params.ramp_down) + self.tolerance;

        let initial = self.initial_state()?;
        let mut value = vec![f64::NEG_INFINITY; n_states];
        value[initial] = 0.0;
        let mut back: Vec<Vec<usize>> = Vec::with_capacity(hours);

        for t in 0..hours {
            let margin = self.prices.power[t]
                - self
                    .params
                    .marginal_cost(self.prices.fuel[t], self.prices.co2[t]);
            let rewards: Vec<f64> = self
                .levels
                .iter()
                .map(|&p| p * margin - self.deviation(t, p))
                .collect();
            let idle = -self.deviation(t, 0.0);

            let mut next = vec![f64::NEG_INFINITY; n_states];
            let mut from = vec![usize::MAX; n_states];

            for counter in 1..=self.cap_stop {
                let source = self.off(counter);
                let v = value[source];
                if v == f64::NEG_INFINITY {
                    continue;
                }
                let stay = self.off((counter + 1).min(self.cap_stop));
                relax(&mut next, &mut from, stay, v + idle, source);
                if counter >= self.params.min_stop_time {
                    for (level, &p) in self.levels.iter().enumerate() {
                        if p <= start_cap {
                            let reward = v + rewards[level] - self.params.start_cost;
                            relax(&mut next, &mut from, self.on(1, level), reward, source);
                        }
                    }
                }
            }

            for counter in 1..=self.cap_run {
                let advanced = (counter + 1).min(self.cap_run);
                for (level, &p) in self.levels.iter().enumerate() {
                    let source = self.on(counter, level);
                    let v = value[source];
                    if v == f64::NEG_INFINITY {
                        continue;
                    }
                    for (next_level, &q) in self.levels.iter().enumerate() {
                        if q - p <= ramp_up && p - q <= ramp_down {
                            let reward = v + rewards[next_level];
                            relax(&mut next, &mut from, self.on(advanced, next_level), reward, source);
                        }
                    }
                    if counter >= self.params.min_run_time && p <= stop_cap {
                        relax(&mut next, &mut from, self.off(1), v + idle, source);
                    }
                }
            }

            back.push(from);
            value = next;
        }

        let mut best = None;
        for (state, &v) in value.iter().enumerate() {
            if v > f64::NEG_INFINITY && best.map_or(true, |(_, b)| v > b) {
                best = Some((state, v));
            }
        }
        let Some((mut state, objective)) = best else {
            return Err(self.infeasible("no schedule satisfies ramp and run-time limits".to_string()));
        };

        let mut power = vec![0.0; hours];
        let mut starts = vec![false; hours];
        for t in (0..hours).rev() {
            let previous = back[t][state];
            let level = self.level_of(state);
            power[t] = level.map_or(0.0, |l| self.levels[l]);
            starts[t] = level.is_some() && self.level_of(previous).is_none();
            state = previous;
        }

        Ok(Solution {
            power,
            starts,
            objective,
        })
    }

    fn dispatch(&self, solution: Solution) -> Dispatch {
        let mut cash_flow = CashFlow::default();
        for (t, &p) in solution.power.iter().enumerate() {
            let fuel_input = p / self.params.efficiency;
            cash_flow.revenue += p * self.prices.power[t];
            cash_flow.fuel += fuel_input * self.prices.fuel[t];
            cash_flow.emission += fuel_input * self.params.emission_factor * self.prices.co2[t];
            if solution.starts[t] {
                cash_flow.start += self.params.start_cost;
            }
        }

        let day = solution.power.len().min(HOURS_PER_DAY);
        let end_state = self.state.advance(&solution.power[..day], self.tolerance);
        Dispatch {
            power: solution.power,
            cash_flow: cash_flow.settle(),
            objective: solution.objective,
            end_state: AssetState::Thermal(end_state),
        }
    }
}

fn relax(next: &mut [f64], from: &mut [usize], target: usize, candidate: f64, source: usize) {
    if candidate > next[target] {
        next[target] = candidate;
        from[target] = source;
    }
}
