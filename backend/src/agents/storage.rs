use super::{check_submission, restore_state, settle_asset, submit, AgentContext, AgentError, MarketParticipant};
use crate::bidding::ExclusiveOrderBuilder;
use crate::models::asset::{Asset, StorageAsset};
use crate::models::forecast::PriceForecast;
use crate::optimizer::StorageOptimizer;
use crate::transport::Phase;
use chrono::NaiveDate;
use tracing::debug;

/// Storage unit bidding one exclusive block per price scenario
pub struct StorageAgent {
    asset: Asset,
    forecast: Option<PriceForecast>,
}

impl StorageAgent {
    pub fn new(asset: StorageAsset) -> Self {
        Self {
            asset: Asset::Storage(asset),
            forecast: None,
        }
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    fn build_bids(&mut self, date: NaiveDate, ctx: &AgentContext) -> Result<(), AgentError> {
        let Asset::Storage(storage) = &self.asset else {
            return Ok(());
        };
        let forecast = ctx.forecasts.forecast(date, 1)?;
        let scenarios = StorageOptimizer::new(storage, &ctx.config.optimizer).optimize_scenarios(&forecast)?;
        debug!(asset = %storage.id, scenarios = scenarios.len(), "scenarios solved");

        let book = ExclusiveOrderBuilder::new(storage, &ctx.config.market).build(&scenarios);
        submit(ctx, date, &storage.id, book)?;
        self.forecast = Some(forecast);
        Ok(())
    }
}

impl MarketParticipant for StorageAgent {
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
