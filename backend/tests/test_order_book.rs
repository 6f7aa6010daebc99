//! Tests for OrderBookBuilder and ExclusiveOrderBuilder

use chrono::NaiveDate;
use market_simulator_core_rs::bidding::{ExclusiveOrderBuilder, OrderBookBuilder};
use market_simulator_core_rs::config::{BiddingConfig, MarketConfig, OptimizerConfig};
use market_simulator_core_rs::models::asset::{FuelType, StorageAsset, StorageParams, StorageState, ThermalAsset, ThermalParams, ThermalState};
use market_simulator_core_rs::models::forecast::{DayForecast, PriceForecast};
use market_simulator_core_rs::models::order::OrderBook;
use market_simulator_core_rs::optimizer::{StorageOptimizer, UnitCommitmentOptimizer};
use std::collections::BTreeMap;

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

fn forecast(days: Vec<Vec<f64>>) -> PriceForecast {
    let days = days
        .into_iter()
        .map(|power| {
            DayForecast::flat(0.0, 0.0, 300.0)
                .with_power(power)
                .with_fuel(FuelType::Gas, 24.0)
        })
        .collect();
    PriceForecast::new(date(), days).unwrap()
}

fn thermal_book(asset: &ThermalAsset, forecast: &PriceForecast) -> OrderBook {
    let config = OptimizerConfig::default();
    let bidding = BiddingConfig::default();
    let market = MarketConfig::default();
    let results = UnitCommitmentOptimizer::new(asset, &config)
        .optimize_steps(date(), forecast, &bidding)
        .unwrap();
    OrderBookBuilder::new(asset, &bidding, &market).build(&results)
}

/// (parent, hours, min price, max price, volume) per block id
struct BlockView {
    parent: Option<u32>,
    hours: Vec<usize>,
    min_price: f64,
    max_price: f64,
    volume: f64,
}

fn blocks(book: &OrderBook) -> BTreeMap<u32, BlockView> {
    let mut out: BTreeMap<u32, BlockView> = BTreeMap::new();
    for (key, order) in book.linked_asks() {
        let view = out.entry(key.block_id).or_insert(BlockView {
            parent: order.parent,
            hours: Vec::new(),
            min_price: f64::INFINITY,
            max_price: f64::NEG_INFINITY,
            volume: 0.0,
        });
        if !view.hours.contains(&key.hour) {
            view.hours.push(key.hour);
        }
        view.min_price = view.min_price.min(order.price);
        view.max_price = view.max_price.max(order.price);
        view.volume += order.volume;
    }
    for view in out.values_mut() {
        view.hours.sort_unstable();
    }
    out
}

fn hourly_volume(book: &OrderBook) -> Vec<f64> {
    let mut volume = vec![0.0; 24];
    for (key, order) in book.linked_asks() {
        volume[key.hour] += order.volume;
    }
    volume
}

#[test]
fn test_flat_price_gives_single_mother() {
    let asset = plant(0.0, ThermalState::cold());
    let book = thermal_book(&asset, &forecast(vec![vec![50.0; 24]]));
    let blocks = blocks(&book);

    let mothers: Vec<u32> = blocks.iter().filter(|(_, b)| b.parent.is_none()).map(|(&id, _)| id).collect();
    assert_eq!(mothers, vec![0]);
    let mother = &blocks[&0];
    assert_eq!(mother.hours, (0..24).collect::<Vec<_>>());
    assert!((mother.max_price - 48.0).abs() < 1e-9);
    assert!((mother.volume - 100.0 * 24.0).abs() < 1e-9);

    for (_, block) in blocks.iter().filter(|(&id, _)| id != 0) {
        assert_eq!(block.parent, Some(0));
        assert_eq!(block.min_price, 50.0);
    }
    for v in hourly_volume(&book) {
        assert!((v - 300.0).abs() < 1e-9);
    }
    assert!(book.validate().rejected.is_empty());
}

#[test]
fn test_unprofitable_plant_offers_at_run_at_max_step() {
    // marginal cost 48 above every forecast price: only the run-at-max
    // step dispatches, priced at marginal cost
    let asset = plant(0.0, ThermalState::cold());
    let book = thermal_book(&asset, &forecast(vec![vec![20.0; 24]]));
    assert!(!book.is_empty());
    for (_, order) in book.linked_asks() {
        assert!(order.price >= 48.0 - 1e-9);
    }
    assert!(book.validate().rejected.is_empty());
}

#[test]
fn test_forest_invariants_on_varying_prices() {
    let asset = plant(2_000.0, ThermalState::cold());
    let prices: Vec<f64> = (0..24)
        .map(|h| match h {
            0..=5 => 30.0,
            6..=9 => 55.0,
            10..=15 => 47.0,
            16..=20 => 90.0,
            _ => 35.0,
        })
        .collect();
    let book = thermal_book(&asset, &forecast(vec![prices]));
    let market = MarketConfig::default();
    let blocks = blocks(&book);

    assert!(!blocks.is_empty());
    assert_eq!(blocks.keys().copied().collect::<Vec<_>>(), (0..blocks.len() as u32).collect::<Vec<_>>());
    assert!(blocks[&0].parent.is_none());
    for (&id, block) in &blocks {
        if let Some(parent) = block.parent {
            assert!(parent < id, "block {id} hangs from later block {parent}");
            assert!(block.min_price >= blocks[&parent].max_price - 1e-9);
        }
        assert!(block.min_price >= market.min_price && block.max_price <= market.max_price);
    }
    for v in hourly_volume(&book) {
        assert!(v <= 300.0 + 1e-9);
    }
    assert!(book.validate().rejected.is_empty());
}

#[test]
fn test_prevented_start_gets_discounted_root() {
    let asset = plant(40_000.0, ThermalState::running(300.0, 24));
    let falling: Vec<f64> = (0..24).map(|h| if h < 12 { 80.0 } else { 40.0 }).collect();
    let book = thermal_book(&asset, &forecast(vec![falling, vec![80.0; 24]]));
    let blocks = blocks(&book);

    let afternoon: Vec<usize> = (12..24).collect();
    let root = blocks
        .values()
        .find(|b| b.parent.is_none() && b.hours == afternoon)
        .expect("afternoon root block");
    let expected = 48.0 - 30_400.0 / 1_200.0;
    assert!((root.min_price - expected).abs() < 1e-6);
    assert!((root.max_price - expected).abs() < 1e-6);
    assert!((root.volume - 100.0 * 12.0).abs() < 1e-9);
    assert!(book.validate().rejected.is_empty());
}

#[test]
fn test_storage_scenarios_become_exclusive_blocks() {
    let asset = StorageAsset::new(
        "STO",
        StorageParams {
            capacity: 800.0,
            min_volume: 0.0,
            charge_power: 100.0,
            discharge_power: 100.0,
            charge_efficiency: 0.8,
            discharge_efficiency: 0.9,
        },
        StorageState { volume: 400.0 },
    )
    .unwrap();
    let config = OptimizerConfig::default();
    let market = MarketConfig::default();
    let spread: Vec<f64> = (0..24).map(|h| if (8..20).contains(&h) { 90.0 } else { 20.0 }).collect();
    let forecast = PriceForecast::new(date(), vec![DayForecast::flat(0.0, 0.0, 300.0).with_power(spread)]).unwrap();

    let scenarios = StorageOptimizer::new(&asset, &config)
        .optimize_scenarios(&forecast)
        .unwrap();
    let book = ExclusiveOrderBuilder::new(&asset, &market).build(&scenarios);

    let block_ids: std::collections::BTreeSet<u32> = book.exclusive_asks().keys().map(|k| k.block_id).collect();
    assert!(!block_ids.is_empty());
    assert!(block_ids.len() <= scenarios.len());
    assert_eq!(block_ids.iter().copied().max(), Some(block_ids.len() as u32 - 1));
    for block in &block_ids {
        let hours = book.exclusive_asks().keys().filter(|k| k.block_id == *block).count();
        assert_eq!(hours, 24);
    }
    assert!(book.linked_asks().is_empty());
    assert!(book.validate().rejected.is_empty());
}
