use super::{AgentContext, AgentError, MarketParticipant};
use crate::core::time::hour_timestamps;
use crate::market::{ClearingStatus, MarketClearingEngine};
use crate::models::event::Event;
use crate::transport::Phase;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::info;

/// Market operator: pools the submitted books and clears them
pub struct MarketAgent {
    id: String,
    engine: MarketClearingEngine,
}

impl MarketAgent {
    pub fn new(id: impl Into<String>, engine: MarketClearingEngine) -> Self {
        Self { id: id.into(), engine }
    }

    fn log_book(&self, date: NaiveDate, ctx: &AgentContext) -> Result<(), AgentError> {
        let book = ctx.stores.orders.get_orders(date)?;
        let summary = book.summary();
        let ask_volume: f64 = summary.iter().map(|h| h.ask_volume).sum();
        let bid_volume: f64 = summary.iter().map(|h| h.bid_volume).sum();
        let thin_hours = summary.iter().filter(|h| h.ask_volume < h.bid_volume).count();
        info!(
            %date,
            agents = ctx.stores.orders.list_agents(date)?.len(),
            ask_volume,
            bid_volume,
            thin_hours,
            "order book closed"
        );
        Ok(())
    }

    fn clear(&self, date: NaiveDate, ctx: &AgentContext) -> Result<(), AgentError> {
        let book = ctx.stores.orders.get_orders(date)?;
        let result = self.engine.clear(date, &book);

        for rejection in &result.rejected {
            ctx.log(Event::OrdersRejected {
                date,
                agent_id: rejection.agent_id.clone(),
                reason: rejection.reason.clone(),
            });
        }
        for warning in &result.warnings {
            ctx.log(Event::ClearingWarning {
                date,
                warning: format!("{:?}", warning),
            });
        }
        ctx.log(Event::MarketCleared {
            date,
            mean_price: result.mean_price(),
            traded_volume: result.traded_volume(),
            source_volume: result.source_volume(),
            sink_volume: result.sink_volume(),
            degraded: result.status == ClearingStatus::Degraded,
        });

        let fields: BTreeMap<String, Vec<f64>> = [
            ("price".to_string(), result.prices()),
            ("supply".to_string(), result.hours.iter().map(|h| h.supply).collect()),
            ("demand".to_string(), result.hours.iter().map(|h| h.demand).collect()),
            ("source".to_string(), result.hours.iter().map(|h| h.source).collect()),
            ("sink".to_string(), result.hours.iter().map(|h| h.sink).collect()),
        ]
        .into_iter()
        .collect();
        ctx.stores
            .series
            .write("clearing", &BTreeMap::new(), &fields, &hour_timestamps(date))?;
        ctx.stores.clearing.set_result(result)?;
        Ok(())
    }
}

impl MarketParticipant for MarketAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn handle(&mut self, phase: Phase, date: NaiveDate, ctx: &AgentContext) -> Result<(), AgentError> {
        match phase {
            Phase::BidSubmitted => self.log_book(date, ctx),
            Phase::Clearing => self.clear(date, ctx),
            _ => Ok(()),
        }
    }
}
