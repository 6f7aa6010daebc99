use super::{check_submission, submit, AgentContext, AgentError, MarketParticipant};
use crate::models::order::{Order, OrderBook};
use crate::transport::Phase;
use chrono::NaiveDate;

/// Inflexible load: buys the forecast demand at the price cap
pub struct DemandAgent {
    id: String,
}

impl DemandAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// One bid per hour with positive demand
    pub fn bids(&self, demand: &[f64], price_cap: f64) -> OrderBook {
        let mut book = OrderBook::new();
        for (hour, &volume) in demand.iter().enumerate() {
            if volume > 0.0 {
                book.add_bid(hour, &self.id, Order::new(price_cap, volume));
            }
        }
        book
    }
}

impl MarketParticipant for DemandAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn handle(&mut self, phase: Phase, date: NaiveDate, ctx: &AgentContext) -> Result<(), AgentError> {
        match phase {
            Phase::BidBuilding => {
                let forecast = ctx.forecasts.forecast(date, 1)?;
                let book = self.bids(forecast.demand(), ctx.config.market.max_price);
                submit(ctx, date, &self.id, book)
            }
            Phase::BidSubmitted => check_submission(ctx, date, &self.id),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_demand_hours_not_bid() {
        let agent = DemandAgent::new("DEM");
        let mut demand = vec![100.0; 24];
        demand[3] = 0.0;
        let book = agent.bids(&demand, 3000.0);
        assert_eq!(book.bids().len(), 23);
        assert!(book.bids().values().all(|b| b.price == 3000.0));
    }
}
