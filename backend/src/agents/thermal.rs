use super::{check_submission, restore_state, settle_asset, submit, AgentContext, AgentError, MarketParticipant};
use crate::bidding::OrderBookBuilder;
use crate::models::asset::{Asset, ThermalAsset};
use crate::models::event::Event;
use crate::models::forecast::PriceForecast;
use crate::optimizer::UnitCommitmentOptimizer;
use crate::transport::Phase;
use chrono::NaiveDate;

/// Days requested from the forecast: delivery day plus lookahead
const FORECAST_HORIZON: usize = 2;

/// Thermal plant bidding linked block orders
pub struct ThermalAgent {
    asset: Asset,
    forecast: Option<PriceForecast>,
}

impl ThermalAgent {
    pub fn new(asset: ThermalAsset) -> Self {
        Self {
            asset: Asset::Thermal(asset),
            forecast: None,
        }
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    fn build_bids(&mut self, date: NaiveDate, ctx: &AgentContext) -> Result<(), AgentError> {
        let Asset::Thermal(plant) = &self.asset else {
            return Ok(());
        };
        let forecast = ctx.forecasts.forecast(date, FORECAST_HORIZON)?;
        let config = &ctx.config;
        let results = UnitCommitmentOptimizer::new(plant, &config.optimizer).optimize_steps(
            date,
            &forecast,
            &config.bidding,
        )?;
        if let Some(prevented) = &results.prevented_start {
            ctx.log(Event::PreventedStart {
                date,
                agent_id: plant.id.clone(),
                hours: prevented.hours.clone(),
                discount: prevented.discount,
            });
        }

        let book = OrderBookBuilder::new(plant, &config.bidding, &config.market).build(&results);
        submit(ctx, date, &plant.id, book)?;
        self.forecast = Some(forecast);
        Ok(())
    }
}

impl MarketParticipant for ThermalAgent {
    fn id(&self) -> &str {
        self.asset.id()
    }

    fn handle(&mut self, phase: Phase, date: NaiveDate, ctx: &AgentContext) -> Result<(), AgentError> {
        match phase {
            Phase::AwaitCapacity => restore_state(ctx, &mut self.asset),
            Phase::BidBuilding => self.build_bids(date, ctx),
            Phase::BidSubmitted => check_submission(ctx, date, self.asset.id()),
            Phase::Settlement => settle_asset(ctx, date, &mut self.asset, self.forecast.as_ref()),
            Phase::NextDay => {
                self.forecast = None;
                Ok(())
            }
            Phase::Clearing | Phase::Terminate => Ok(()),
        }
    }
}
