//! Tests for UnitCommitmentOptimizer
//!
//! Plant used throughout: 100-300 MW, efficiency 0.5, gas at 24 €/MWh_th,
//! so the marginal cost is 48 €/MWh.

use chrono::NaiveDate;
use market_simulator_core_rs::config::{BiddingConfig, OptimizerConfig, PriceStep};
use market_simulator_core_rs::models::asset::{AssetState, FuelType, ThermalAsset, ThermalParams, ThermalState};
use market_simulator_core_rs::models::forecast::{DayForecast, PriceForecast};
use market_simulator_core_rs::optimizer::{DispatchOptimizer, OptimizationError, UnitCommitmentOptimizer};

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2018, 1, 1).unwrap()
}

fn plant(start_cost: f64, state: ThermalState) -> ThermalAsset {
    ThermalAsset::new(
        "PWP",
        ThermalParams {
            max_power: 300.0,
            min_power: 100.0,
            efficiency: 0.5,
            emission_factor: 0.0,
            ramp_up: 300.0,
            ramp_down: 300.0,
            min_run_time: 1,
            min_stop_time: 1,
            start_cost,
            fuel: FuelType::Gas,
        },
        state,
    )
    .unwrap()
}

fn day(power: Vec<f64>) -> DayForecast {
    DayForecast::flat(0.0, 0.0, 0.0)
        .with_power(power)
        .with_fuel(FuelType::Gas, 24.0)
}

fn forecast(days: Vec<Vec<f64>>) -> PriceForecast {
    PriceForecast::new(date(), days.into_iter().map(day).collect()).unwrap()
}

/// 80 €/MWh until noon, 40 €/MWh afterwards
fn falling_day() -> Vec<f64> {
    (0..24).map(|h| if h < 12 { 80.0 } else { 40.0 }).collect()
}

#[test]
fn test_flat_profitable_price_runs_at_max() {
    let asset = plant(0.0, ThermalState::cold());
    let config = OptimizerConfig::default();
    let dispatch = UnitCommitmentOptimizer::new(&asset, &config)
        .optimize(date(), &forecast(vec![vec![50.0; 24]]))
        .unwrap();

    assert!(dispatch.power.iter().all(|&p| p == 300.0));
    assert!((dispatch.cash_flow.revenue - 300.0 * 50.0 * 24.0).abs() < 1e-6);
    assert!((dispatch.cash_flow.fuel - 300.0 * 48.0 * 24.0).abs() < 1e-6);
    assert_eq!(dispatch.end_state, AssetState::Thermal(ThermalState::running(300.0, 24)));
}

#[test]
fn test_start_cost_paid_once() {
    let asset = plant(1_000.0, ThermalState::cold());
    let config = OptimizerConfig::default();
    let dispatch = UnitCommitmentOptimizer::new(&asset, &config)
        .optimize(date(), &forecast(vec![vec![60.0; 24]]))
        .unwrap();

    assert!(dispatch.power.iter().all(|&p| p == 300.0));
    assert_eq!(dispatch.cash_flow.start, 1_000.0);
    assert!((dispatch.cash_flow.profit - (300.0 * 12.0 * 24.0 - 1_000.0)).abs() < 1e-6);
}

#[test]
fn test_steps_solved_in_ascending_order() {
    let asset = plant(0.0, ThermalState::cold());
    let config = OptimizerConfig::default();
    let bidding = BiddingConfig::default();
    let results = UnitCommitmentOptimizer::new(&asset, &config)
        .optimize_steps(date(), &forecast(vec![vec![50.0; 24]]), &bidding)
        .unwrap();

    assert_eq!(results.steps.len(), bidding.price_steps.len());
    assert_eq!(results.steps.last().map(|s| s.step), Some(PriceStep::RunAtMax));
    assert!(results.marginal_cost.iter().all(|&c| (c - 48.0).abs() < 1e-9));
    assert_eq!(results.forecast_prices, vec![50.0; 24]);

    // below marginal cost the plant stays off, above it runs at max
    let at = |offset: f64| {
        results
            .steps
            .iter()
            .find(|s| s.step == PriceStep::Offset(offset))
            .map(|s| s.dispatch.power.clone())
            .unwrap()
    };
    assert!(at(-10.0).iter().all(|&p| p == 0.0));
    assert!(at(0.0).iter().all(|&p| p == 300.0));
    assert!(results.steps.last().unwrap().dispatch.power.iter().all(|&p| p == 300.0));
}

#[test]
fn test_no_prevented_start_without_lookahead() {
    let asset = plant(40_000.0, ThermalState::running(300.0, 24));
    let config = OptimizerConfig::default();
    let results = UnitCommitmentOptimizer::new(&asset, &config)
        .optimize_steps(date(), &forecast(vec![falling_day()]), &BiddingConfig::default())
        .unwrap();
    assert!(results.prevented_start.is_none());
}

#[test]
fn test_prevented_start_detected() {
    // myopic: stop at noon, restart tomorrow for 40 000
    // joint: stay at 100 MW through the afternoon for 12 · 800 = 9 600
    let asset = plant(40_000.0, ThermalState::running(300.0, 24));
    let config = OptimizerConfig::default();
    let results = UnitCommitmentOptimizer::new(&asset, &config)
        .optimize_steps(
            date(),
            &forecast(vec![falling_day(), vec![80.0; 24]]),
            &BiddingConfig::default(),
        )
        .unwrap();

    assert!(results.base.power[12..].iter().all(|&p| p == 0.0));
    let prevented = results.prevented_start.expect("shutdown should be prevented");
    assert_eq!(prevented.hours, (12..24).collect::<Vec<_>>());
    assert!((prevented.gain - 30_400.0).abs() < 1e-6);
    assert!((prevented.discount - 30_400.0 / 1_200.0).abs() < 1e-6);
}

#[test]
fn test_lookahead_without_fuel_skips_prevented_start() {
    // same situation as above but tomorrow carries no gas price
    let asset = plant(40_000.0, ThermalState::running(300.0, 24));
    let config = OptimizerConfig::default();
    let tomorrow = DayForecast::flat(0.0, 0.0, 0.0).with_power(vec![80.0; 24]);
    let forecast = PriceForecast::new(date(), vec![day(falling_day()), tomorrow]).unwrap();
    let results = UnitCommitmentOptimizer::new(&asset, &config)
        .optimize_steps(date(), &forecast, &BiddingConfig::default())
        .unwrap();

    assert!(results.base.power[12..].iter().all(|&p| p == 0.0));
    assert!(results.prevented_start.is_none());
    assert_eq!(results.steps.len(), BiddingConfig::default().price_steps.len());
}

#[test]
fn test_post_market_reproduces_optimum() {
    let asset = plant(500.0, ThermalState::cold());
    let config = OptimizerConfig::default();
    let optimizer = UnitCommitmentOptimizer::new(&asset, &config);
    let prices: Vec<f64> = (0..24).map(|h| 30.0 + 3.0 * h as f64).collect();
    let forecast = forecast(vec![prices.clone()]);

    let optimum = optimizer.optimize(date(), &forecast).unwrap();
    let realized = optimizer
        .optimize_post_market(&optimum.power, Some(&prices), &forecast)
        .unwrap();
    assert_eq!(realized.power, optimum.power);
    assert_eq!(realized.end_state, optimum.end_state);
}

#[test]
fn test_post_market_tracks_within_limits() {
    // a commitment above max power is followed as far as possible
    let asset = plant(0.0, ThermalState::cold());
    let config = OptimizerConfig::default();
    let forecast = forecast(vec![vec![50.0; 24]]);
    let realized = UnitCommitmentOptimizer::new(&asset, &config)
        .optimize_post_market(&[350.0; 24], None, &forecast)
        .unwrap();
    assert!(realized.power.iter().all(|&p| p == 300.0));
}

#[test]
fn test_missing_fuel_price_is_error() {
    let asset = plant(0.0, ThermalState::cold());
    let config = OptimizerConfig::default();
    let forecast = PriceForecast::new(date(), vec![DayForecast::flat(50.0, 0.0, 0.0)]).unwrap();
    let err = UnitCommitmentOptimizer::new(&asset, &config)
        .optimize(date(), &forecast)
        .unwrap_err();
    assert!(matches!(err, OptimizationError::MissingForecast { .. }));
}

#[test]
fn test_commitment_length_checked() {
    let asset = plant(0.0, ThermalState::cold());
    let config = OptimizerConfig::default();
    let err = UnitCommitmentOptimizer::new(&asset, &config)
        .optimize_post_market(&[100.0; 12], None, &forecast(vec![vec![50.0; 24]]))
        .unwrap_err();
    assert!(matches!(
        err,
        OptimizationError::Length {
            expected: 24,
            actual: 12,
            ..
        }
    ));
}
