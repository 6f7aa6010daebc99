//! Tests for StorageOptimizer and the price-shape scenarios

use chrono::NaiveDate;
use market_simulator_core_rs::config::OptimizerConfig;
use market_simulator_core_rs::models::asset::{AssetState, StorageAsset, StorageParams, StorageState};
use market_simulator_core_rs::models::forecast::{DayForecast, PriceForecast};
use market_simulator_core_rs::optimizer::{DispatchOptimizer, OptimizationError, PriceScenario, StorageOptimizer};

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2018, 1, 1).unwrap()
}

fn storage(volume: f64) -> StorageAsset {
    StorageAsset::new(
        "STO",
        StorageParams {
            capacity: 800.0,
            min_volume: 0.0,
            charge_power: 100.0,
            discharge_power: 100.0,
            charge_efficiency: 0.8,
            discharge_efficiency: 0.9,
        },
        StorageState { volume },
    )
    .unwrap()
}

fn spread() -> Vec<f64> {
    (0..24).map(|h| if (8..20).contains(&h) { 90.0 } else { 20.0 }).collect()
}

fn forecast(prices: Vec<f64>) -> PriceForecast {
    let demand: Vec<f64> = (0..24).map(|h| 300.0 + 10.0 * h as f64).collect();
    let day = DayForecast::flat(0.0, 0.0, 0.0).with_power(prices).with_demand(demand);
    PriceForecast::new(date(), vec![day]).unwrap()
}

#[test]
fn test_scenarios_in_fixed_order() {
    let asset = storage(400.0);
    let config = OptimizerConfig::default();
    let scenarios = StorageOptimizer::new(&asset, &config)
        .optimize_scenarios(&forecast(spread()))
        .unwrap();
    let kinds: Vec<PriceScenario> = scenarios.iter().map(|s| s.scenario).collect();
    assert_eq!(kinds, PriceScenario::ALL.to_vec());
}

#[test]
fn test_every_scenario_ends_at_terminal_volume() {
    let asset = storage(400.0);
    let config = OptimizerConfig::default();
    let optimizer = StorageOptimizer::new(&asset, &config);
    assert_eq!(optimizer.terminal_volume(), 400.0);

    for scenario in optimizer.optimize_scenarios(&forecast(spread())).unwrap() {
        assert_eq!(
            scenario.dispatch.end_state,
            AssetState::Storage(StorageState { volume: 400.0 }),
            "{:?}",
            scenario.scenario
        );
        assert_eq!(scenario.prices.len(), 24);
        for &p in &scenario.dispatch.power {
            assert!((-100.0 - 1e-9..=100.0 + 1e-9).contains(&p));
        }
    }
}

#[test]
fn test_base_scenario_matches_plain_optimization() {
    let asset = storage(400.0);
    let config = OptimizerConfig::default();
    let optimizer = StorageOptimizer::new(&asset, &config);
    let forecast = forecast(spread());

    let plain = optimizer.optimize(date(), &forecast).unwrap();
    let scenarios = optimizer.optimize_scenarios(&forecast).unwrap();
    let base = scenarios.iter().find(|s| s.scenario == PriceScenario::Base).unwrap();
    assert_eq!(base.dispatch.power, plain.power);
    assert!(plain.cash_flow.profit > 0.0);
}

#[test]
fn test_post_market_reproduces_each_scenario() {
    let asset = storage(400.0);
    let config = OptimizerConfig::default();
    let optimizer = StorageOptimizer::new(&asset, &config);
    let forecast = forecast(spread());

    for scenario in optimizer.optimize_scenarios(&forecast).unwrap() {
        let realized = optimizer
            .optimize_post_market(&scenario.dispatch.power, Some(&scenario.prices), &forecast)
            .unwrap();
        for (r, c) in realized.power.iter().zip(&scenario.dispatch.power) {
            assert!((r - c).abs() < 1e-9, "{:?}", scenario.scenario);
        }
    }
}

#[test]
fn test_unreachable_terminal_volume_is_infeasible() {
    let asset = StorageAsset::new(
        "STO",
        StorageParams {
            capacity: 800.0,
            min_volume: 0.0,
            charge_power: 1.0,
            discharge_power: 1.0,
            charge_efficiency: 0.9,
            discharge_efficiency: 0.9,
        },
        StorageState { volume: 0.0 },
    )
    .unwrap();
    let config = OptimizerConfig::default();
    let err = StorageOptimizer::new(&asset, &config)
        .optimize(date(), &forecast(spread()))
        .unwrap_err();
    assert!(matches!(err, OptimizationError::Infeasible { .. }));
}
