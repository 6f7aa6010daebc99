//! Tests for MarketClearingEngine

use chrono::NaiveDate;
use market_simulator_core_rs::config::MarketConfig;
use market_simulator_core_rs::market::{ClearingResult, ClearingStatus, ClearingWarning, MarketClearingEngine, OrderKind};
use market_simulator_core_rs::models::order::{LinkedOrder, Order, OrderBook, OrderKey};

const PEAK: std::ops::RangeInclusive<usize> = 8..=20;

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2018, 1, 1).unwrap()
}

/// Mother of 100 MW over the whole day plus one 200 MW child per hour
fn plant(book: &mut OrderBook, agent: &str, price: f64) {
    for hour in 0..24 {
        book.add_linked(OrderKey::new(0, hour, 0, agent), LinkedOrder::new(price, 100.0, None));
        book.add_linked(
            OrderKey::new(hour as u32 + 1, hour, 0, agent),
            LinkedOrder::new(price, 200.0, Some(0)),
        );
    }
}

fn demand(book: &mut OrderBook, volume: impl Fn(usize) -> f64) {
    for hour in 0..24 {
        book.add_bid(hour, "DEM", Order::new(3000.0, volume(hour)));
    }
}

fn assert_balanced(result: &ClearingResult) {
    for hour in &result.hours {
        let lhs = hour.supply + hour.source;
        let rhs = hour.demand + hour.sink;
        assert!((lhs - rhs).abs() < 1e-6, "hour {} unbalanced: {} vs {}", hour.hour, lhs, rhs);
    }
}

#[test]
fn test_two_plants_peak_and_off_peak() {
    let mut book = OrderBook::new();
    plant(&mut book, "CHEAP", 20.0);
    plant(&mut book, "DEAR", 40.0);
    demand(&mut book, |h| if PEAK.contains(&h) { 450.0 } else { 250.0 });

    let result = MarketClearingEngine::new(MarketConfig::default()).clear(date(), &book);

    assert_eq!(result.status, ClearingStatus::Optimal);
    assert_eq!(result.block_activation("CHEAP", 0), Some(1.0));
    assert_eq!(result.block_activation("DEAR", 0), Some(1.0));
    for hour in &result.hours {
        if PEAK.contains(&hour.hour) {
            assert_eq!(hour.price, 40.0);
        } else {
            assert!(hour.price <= 40.0);
        }
        assert!((hour.supply - hour.demand).abs() < 1e-6);
    }
    assert!(result.source_volume() < 1e-9);
    assert!(result.sink_volume() < 1e-9);
    assert_balanced(&result);

    let cheap = result.agent_volumes("CHEAP");
    let dear = result.agent_volumes("DEAR");
    assert!((cheap[10] - 300.0).abs() < 1e-9);
    assert!((dear[10] - 150.0).abs() < 1e-9);
    assert!((cheap[2] - 150.0).abs() < 1e-9);
    assert!((dear[2] - 100.0).abs() < 1e-9);
}

#[test]
fn test_bids_fully_cleared() {
    let mut book = OrderBook::new();
    plant(&mut book, "PWP", 30.0);
    demand(&mut book, |_| 120.0);
    let result = MarketClearingEngine::new(MarketConfig::default()).clear(date(), &book);

    let bids: Vec<_> = result.acceptances.iter().filter(|a| a.kind == OrderKind::Bid).collect();
    assert_eq!(bids.len(), 24);
    assert!(bids.iter().all(|a| a.activation == 1.0));
    assert!(result.agent_volumes("DEM").iter().all(|&v| (v + 120.0).abs() < 1e-9));
}

/// Base load at 30 except a scarce 90 €/MWh evening hour
fn exclusive_market(book: &mut OrderBook) {
    demand(book, |_| 100.0);
    for hour in 0..24 {
        let price = if hour == 18 { 90.0 } else { 30.0 };
        book.add_single_ask(hour, "GEN", Order::new(price, 200.0));
    }
}

fn storage_block(book: &mut OrderBook, block: u32, discharge_price: f64) {
    for hour in 0..24 {
        let order = match hour {
            3 => Order::new(30.0, -50.0),
            18 => Order::new(discharge_price, 40.0),
            _ => Order::new(30.0, 0.0),
        };
        book.add_exclusive(block, hour, "STO", order);
    }
}

#[test]
fn test_one_exclusive_block_selected() {
    let mut book = OrderBook::new();
    exclusive_market(&mut book);
    // block 0 saves 40 · (90 − 40) for 50 · 30 of charging, block 1 loses
    storage_block(&mut book, 0, 40.0);
    storage_block(&mut book, 1, 80.0);

    let result = MarketClearingEngine::new(MarketConfig::default()).clear(date(), &book);

    let selected = result.selected_exclusive_blocks();
    assert_eq!(selected.get("STO"), Some(&0));
    assert_eq!(selected.len(), 1);
    let storage = result.agent_volumes("STO");
    assert!((storage[3] + 50.0).abs() < 1e-9);
    assert!((storage[18] - 40.0).abs() < 1e-9);
    assert!((result.hours[3].demand - 150.0).abs() < 1e-9);
    assert_eq!(result.hours[18].price, 90.0);
    assert_balanced(&result);
}

#[test]
fn test_unprofitable_exclusive_blocks_rejected() {
    let mut book = OrderBook::new();
    exclusive_market(&mut book);
    storage_block(&mut book, 0, 85.0);

    let result = MarketClearingEngine::new(MarketConfig::default()).clear(date(), &book);
    assert!(result.selected_exclusive_blocks().is_empty());
    assert!(result.agent_volumes("STO").iter().all(|&v| v == 0.0));
}

#[test]
fn test_local_search_budget_flags_degraded() {
    let mut book = OrderBook::new();
    plant(&mut book, "CHEAP", 20.0);
    plant(&mut book, "DEAR", 40.0);
    demand(&mut book, |_| 250.0);

    let config = MarketConfig {
        exhaustive_limit: 1,
        max_search_passes: 0,
        ..MarketConfig::default()
    };
    let result = MarketClearingEngine::new(config).clear(date(), &book);
    assert_eq!(result.status, ClearingStatus::Degraded);
    // still a balanced, feasible result
    assert_balanced(&result);
}

#[test]
fn test_local_search_matches_exhaustive() {
    let mut book = OrderBook::new();
    plant(&mut book, "CHEAP", 20.0);
    plant(&mut book, "DEAR", 40.0);
    demand(&mut book, |h| if PEAK.contains(&h) { 450.0 } else { 250.0 });

    let exhaustive = MarketClearingEngine::new(MarketConfig::default()).clear(date(), &book);
    let local = MarketClearingEngine::new(MarketConfig {
        exhaustive_limit: 1,
        ..MarketConfig::default()
    })
    .clear(date(), &book);

    // same auction, but a local minimum proves nothing
    assert_eq!(exhaustive.status, ClearingStatus::Optimal);
    assert_eq!(local.status, ClearingStatus::Degraded);
    assert_eq!(local.prices(), exhaustive.prices());
    assert!((local.objective - exhaustive.objective).abs() < 1e-6);
}

#[test]
fn test_pricier_parent_unlocks_cheaper_child() {
    // chain 10 <- 9 <- 8: hour 9 has a cheaper rival, hour 8 only a peaker
    let mut book = OrderBook::new();
    book.add_linked(OrderKey::new(0, 10, 0, "PWP"), LinkedOrder::new(50.0, 100.0, None));
    book.add_linked(OrderKey::new(1, 9, 0, "PWP"), LinkedOrder::new(50.0, 100.0, Some(0)));
    book.add_linked(OrderKey::new(2, 8, 0, "PWP"), LinkedOrder::new(50.0, 100.0, Some(1)));
    book.add_single_ask(9, "GEN", Order::new(40.0, 100.0));
    book.add_single_ask(8, "PEAKER", Order::new(1000.0, 100.0));
    for hour in 8..=10 {
        book.add_bid(hour, "DEM", Order::new(3000.0, 100.0));
    }

    let result = MarketClearingEngine::new(MarketConfig::default()).clear(date(), &book);

    assert_eq!(result.status, ClearingStatus::Optimal);
    assert!((result.objective - 15_000.0).abs() < 1e-6);
    let pwp = result.agent_volumes("PWP");
    for hour in 8..=10 {
        assert!((pwp[hour] - 100.0).abs() < 1e-6, "hour {}: {}", hour, pwp[hour]);
        assert_eq!(result.hours[hour].price, 50.0);
    }
    assert!(result.agent_volumes("GEN")[9].abs() < 1e-6);
    assert!(result.agent_volumes("PEAKER")[8].abs() < 1e-6);
    let chained = result.block_activation("PWP", 2).unwrap();
    assert!((chained - 1.0).abs() < 1e-6);
    assert!(result.source_volume() < 1e-9);
    assert_balanced(&result);
}

#[test]
fn test_shortfall_covered_by_source() {
    let mut book = OrderBook::new();
    for hour in 0..24 {
        book.add_single_ask(hour, "GEN", Order::new(25.0, 50.0));
    }
    demand(&mut book, |_| 80.0);
    let result = MarketClearingEngine::new(MarketConfig::default()).clear(date(), &book);

    // the source does not set the price while an ask is accepted
    assert!(result.prices().iter().all(|&p| p == 25.0));
    assert!((result.source_volume() - 30.0 * 24.0).abs() < 1e-6);
    assert!(result
        .warnings
        .iter()
        .any(|w| matches!(w, ClearingWarning::MagicSourceUsed { hour: 0, .. })));
}

#[test]
fn test_clearing_is_idempotent() {
    let mut book = OrderBook::new();
    plant(&mut book, "CHEAP", 20.0);
    plant(&mut book, "DEAR", 40.0);
    storage_block(&mut book, 0, 40.0);
    demand(&mut book, |h| if PEAK.contains(&h) { 450.0 } else { 250.0 });

    let engine = MarketClearingEngine::new(MarketConfig::default());
    assert_eq!(engine.clear(date(), &book), engine.clear(date(), &book));
}
