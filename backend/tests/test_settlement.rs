//! Tests for SettlementPostProcessor

use chrono::NaiveDate;
use market_simulator_core_rs::config::OptimizerConfig;
use market_simulator_core_rs::models::asset::{
    Asset, AssetState, FuelType, StorageAsset, StorageParams, StorageState, ThermalAsset, ThermalParams, ThermalState,
};
use market_simulator_core_rs::models::forecast::{DayForecast, PriceForecast};
use market_simulator_core_rs::optimizer::{DispatchOptimizer, OptimizationError, StorageOptimizer, UnitCommitmentOptimizer};
use market_simulator_core_rs::settlement::SettlementPostProcessor;
use std::collections::BTreeSet;

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2018, 1, 1).unwrap()
}

fn thermal(state: ThermalState) -> ThermalAsset {
    ThermalAsset::new(
        "PWP",
        ThermalParams {
            max_power: 300.0,
            min_power: 100.0,
            efficiency: 0.5,
            emission_factor: 0.0,
            ramp_up: 300.0,
            ramp_down: 300.0,
            min_run_time: 2,
            min_stop_time: 2,
            start_cost: 1_000.0,
            fuel: FuelType::Gas,
        },
        state,
    )
    .unwrap()
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

fn evening_peak() -> Vec<f64> {
    (0..24).map(|h| if (17..22).contains(&h) { 95.0 } else { 30.0 }).collect()
}

fn forecast(prices: Vec<f64>) -> PriceForecast {
    let day = DayForecast::flat(0.0, 0.0, 0.0)
        .with_power(prices)
        .with_fuel(FuelType::Gas, 24.0);
    PriceForecast::new(date(), vec![day]).unwrap()
}

#[test]
fn test_thermal_commitment_reproduced() {
    let config = OptimizerConfig::default();
    let plant = thermal(ThermalState::cold());
    let forecast = forecast(evening_peak());
    let optimum = UnitCommitmentOptimizer::new(&plant, &config)
        .optimize(date(), &forecast)
        .unwrap();

    let mut asset = Asset::Thermal(plant);
    let settlement = SettlementPostProcessor::new(&config)
        .settle(&mut asset, &optimum.power, &evening_peak(), &BTreeSet::new(), &forecast)
        .unwrap();

    assert!(settlement.skipped.is_none());
    assert_eq!(settlement.realized, optimum.power);
    assert!(settlement.deviation() < 1e-9);
    assert!((settlement.cash_flow.profit - optimum.cash_flow.profit).abs() < 1e-6);
    assert_eq!(settlement.end_state, optimum.end_state);
    assert_eq!(asset.state(), optimum.end_state);
}

#[test]
fn test_state_carried_into_next_day() {
    let config = OptimizerConfig::default();
    let forecast = forecast(vec![60.0; 24]);
    let processor = SettlementPostProcessor::new(&config);
    let mut asset = Asset::Thermal(thermal(ThermalState::cold()));

    let first = processor
        .settle(&mut asset, &[300.0; 24], &[60.0; 24], &BTreeSet::new(), &forecast)
        .unwrap();
    assert_eq!(first.cash_flow.start, 1_000.0);

    // already running: no second start
    let second = processor
        .settle(&mut asset, &[300.0; 24], &[60.0; 24], &BTreeSet::new(), &forecast)
        .unwrap();
    assert_eq!(second.cash_flow.start, 0.0);
    assert_eq!(asset.state(), AssetState::Thermal(ThermalState::running(300.0, 48)));
}

#[test]
fn test_shortfall_against_commitment_reported() {
    // cold plant with min stop time cannot follow a commitment beyond its
    // ramp: the realized schedule deviates but stays feasible
    let config = OptimizerConfig::default();
    let mut state = ThermalState::cold();
    state.off_hours = 1;
    let mut asset = Asset::Thermal(thermal(state));
    let settlement = SettlementPostProcessor::new(&config)
        .settle(&mut asset, &[300.0; 24], &[60.0; 24], &BTreeSet::new(), &forecast(vec![60.0; 24]))
        .unwrap();

    assert_eq!(settlement.realized[0], 0.0);
    assert!(settlement.realized[1..].iter().all(|&p| p == 300.0));
    assert!((settlement.deviation() - 300.0).abs() < 1e-9);
}

#[test]
fn test_storage_scenario_reproduced_with_aborted_hours() {
    let config = OptimizerConfig::default();
    let sto = storage(400.0);
    let prices = evening_peak();
    let optimum = StorageOptimizer::new(&sto, &config).solve_prices(&prices).unwrap();

    let aborted: BTreeSet<usize> = [18].into_iter().collect();
    let mut asset = Asset::Storage(sto);
    let settlement = SettlementPostProcessor::new(&config)
        .settle(&mut asset, &optimum.power, &prices, &aborted, &forecast(prices.clone()))
        .unwrap();

    for (r, c) in settlement.realized.iter().zip(&optimum.power) {
        assert!((r - c).abs() < 1e-9);
    }
    let expected: f64 = settlement
        .realized
        .iter()
        .zip(&prices)
        .enumerate()
        .filter(|(h, _)| *h != 18)
        .map(|(_, (p, price))| p * price)
        .sum();
    assert!((settlement.cash_flow.profit - expected).abs() < 1e-6);
    assert_eq!(settlement.aborted_hours, vec![18]);
    assert_eq!(asset.state(), AssetState::Storage(StorageState { volume: 400.0 }));
}

#[test]
fn test_infeasible_thermal_dispatches_zero() {
    let config = OptimizerConfig::default();
    let contradictory = ThermalState {
        power: 150.0,
        on_hours: 2,
        off_hours: 3,
    };
    let mut asset = Asset::Thermal(thermal(contradictory));
    let settlement = SettlementPostProcessor::new(&config)
        .settle(&mut asset, &[300.0; 24], &[60.0; 24], &BTreeSet::new(), &forecast(vec![60.0; 24]))
        .unwrap();

    assert!(matches!(settlement.skipped, Some(OptimizationError::Infeasible { .. })));
    assert!(settlement.realized.iter().all(|&p| p == 0.0));
    assert_eq!(settlement.cash_flow.profit, 0.0);
    let AssetState::Thermal(state) = asset.state() else {
        panic!("thermal asset lost its kind");
    };
    assert!(!state.is_on());
    assert_eq!(state.power, 0.0);
}
