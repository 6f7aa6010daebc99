//! Exclusive block orders for storage
//!
//! Each price-shape scenario yields one complete day trajectory. The
//! trajectories are offered as mutually exclusive blocks: the market
//! accepts at most one of them in full.
//!
//! Charging hours are bid at the scenario price. Discharging hours are
//! asked at no less than the break-even price of the energy charged in the
//! same scenario:
//!
//! ```text
//! break_even = mean(scenario price over charging hours) / (η⁺ · η⁻)
//! ask        = max((scenario price + break_even) / 2, break_even)
//! ```

use crate::config::MarketConfig;
use crate::models::asset::StorageAsset;
use crate::models::order::{Order, OrderBook};
use crate::optimizer::storage::ScenarioDispatch;
use tracing::debug;

pub struct ExclusiveOrderBuilder<'a> {
    asset: &'a StorageAsset,
    market: &'a MarketConfig,
}

impl<'a> ExclusiveOrderBuilder<'a> {
    pub fn new(asset: &'a StorageAsset, market: &'a MarketConfig) -> Self {
        Self { asset, market }
    }

    /// One exclusive block per distinct, non-idle scenario schedule
    pub fn build(&self, scenarios: &[ScenarioDispatch]) -> OrderBook {
        let tolerance = self.market.tolerance;
        let mut blocks: Vec<Vec<Order>> = Vec::new();

        for scenario in scenarios {
            if scenario.dispatch.is_idle(tolerance) {
                debug!(asset = %self.asset.id, scenario = ?scenario.scenario, "idle scenario skipped");
                continue;
            }
            let orders = self.price(scenario);
            let duplicate = blocks.iter().any(|block| same_orders(block, &orders, tolerance));
            if !duplicate {
                blocks.push(orders);
            }
        }

        let mut book = OrderBook::new();
        for (block_id, orders) in blocks.iter().enumerate() {
            for (hour, order) in orders.iter().enumerate() {
                book.add_exclusive(block_id as u32, hour, &self.asset.id, *order);
            }
        }
        debug!(asset = %self.asset.id, blocks = blocks.len(), "exclusive blocks built");
        book
    }

    /// Hourly orders of one scenario, volumes signed like the schedule
    fn price(&self, scenario: &ScenarioDispatch) -> Vec<Order> {
        let tolerance = self.market.tolerance;
        let power = &scenario.dispatch.power;
        let prices = &scenario.prices;

        let charging: Vec<f64> = power
            .iter()
            .zip(prices)
            .filter(|(p, _)| **p < -tolerance)
            .map(|(_, &price)| price)
            .collect();
        let reference = if charging.is_empty() { prices } else { &charging };
        let mean = reference.iter().sum::<f64>() / reference.len().max(1) as f64;
        let break_even = mean / self.asset.params.round_trip_efficiency();

        power
            .iter()
            .zip(prices)
            .map(|(&volume, &price)| {
                let ask = if volume > tolerance {
                    ((price + break_even) / 2.0).max(break_even)
                } else {
                    price
                };
                Order::new(ask.clamp(self.market.min_price, self.market.max_price), volume)
            })
            .collect()
    }
}

fn same_orders(a: &[Order], b: &[Order], tolerance: f64) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| (x.price - y.price).abs() <= tolerance && (x.volume - y.volume).abs() <= tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::{AssetState, StorageParams, StorageState};
    use crate::optimizer::{CashFlow, Dispatch, PriceScenario};

    fn asset() -> StorageAsset {
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
            StorageState { volume: 400.0 },
        )
        .unwrap()
    }

    fn scenario(scenario: PriceScenario, power: Vec<f64>, prices: Vec<f64>) -> ScenarioDispatch {
        ScenarioDispatch {
            scenario,
            prices,
            dispatch: Dispatch {
                power,
                cash_flow: CashFlow::default(),
                objective: 0.0,
                end_state: AssetState::Storage(StorageState { volume: 400.0 }),
            },
        }
    }

    #[test]
    fn test_discharge_asked_at_or_above_break_even() {
        let asset = asset();
        let market = MarketConfig::default();
        let mut power = vec![0.0; 24];
        power[2] = -100.0;
        power[18] = 72.0;
        let mut prices = vec![50.0; 24];
        prices[2] = 36.0;
        prices[18] = 40.0;

        let book = ExclusiveOrderBuilder::new(&asset, &market).build(&[scenario(PriceScenario::Base, power, prices)]);
        let asks = book.exclusive_asks();
        assert_eq!(asks.len(), 24);

        let break_even = 36.0 / 0.72;
        let discharge = asks.iter().find(|(k, _)| k.hour == 18).map(|(_, o)| *o).unwrap();
        assert!((discharge.price - break_even).abs() < 1e-9);
        let charge = asks.iter().find(|(k, _)| k.hour == 2).map(|(_, o)| *o).unwrap();
        assert_eq!(charge.price, 36.0);
        assert_eq!(charge.volume, -100.0);
    }

    #[test]
    fn test_duplicates_and_idle_scenarios_dropped() {
        let asset = asset();
        let market = MarketConfig::default();
        let mut power = vec![0.0; 24];
        power[3] = -50.0;
        power[19] = 36.0;
        let prices = vec![60.0; 24];

        let book = ExclusiveOrderBuilder::new(&asset, &market).build(&[
            scenario(PriceScenario::Base, power.clone(), prices.clone()),
            scenario(PriceScenario::ShiftLater, power, prices.clone()),
            scenario(PriceScenario::PeakOffPeak, vec![0.0; 24], prices),
        ]);
        assert!(book.exclusive_asks().keys().all(|k| k.block_id == 0));
    }
}
