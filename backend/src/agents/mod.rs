//! Market participants
//!
//! Every participant runs in its own tokio task, reacting to the phase
//! triggers of the [`DayCycleController`](crate::orchestrator::DayCycleController):
//!
//! | Agent | BidBuilding | Clearing | Settlement |
//! |---|---|---|---|
//! | [`ThermalAgent`] | linked orders | | post-market dispatch |
//! | [`StorageAgent`] | exclusive orders | | post-market dispatch |
//! | [`DemandAgent`] | bids at the price cap | | |
//! | [`MarketAgent`] | | clears the pooled book | |
//!
//! Participants talk only through the [`Stores`]; the order book of a day
//! is complete once the bid barrier has passed.

pub mod demand;
pub mod market;
pub mod storage;
pub mod thermal;

pub use demand::DemandAgent;
pub use market::MarketAgent;
pub use storage::StorageAgent;
pub use thermal::ThermalAgent;

use crate::config::SimulationConfig;
use crate::core::time::hour_timestamps;
use crate::logger::agent_span;
use crate::models::asset::{Asset, AssetError};
use crate::models::event::{Event, EventLog};
use crate::models::forecast::{ForecastError, ForecastProvider, PriceForecast};
use crate::models::order::{OrderBook, OrderBookError};
use crate::optimizer::OptimizationError;
use crate::settlement::{SettlementError, SettlementPostProcessor};
use crate::store::{StoreError, Stores};
use crate::transport::{AckStatus, Phase, PhaseAck, Trigger};
use chrono::{NaiveDate, NaiveTime};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Forecast(#[from] ForecastError),

    #[error(transparent)]
    Optimization(#[from] OptimizationError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error("orders rejected: {0}")]
    Rejected(#[from] OrderBookError),

    #[error("no clearing result for {date}")]
    MissingClearing { date: NaiveDate },
}

/// Shared handles every agent task receives
#[derive(Clone)]
pub struct AgentContext {
    pub config: Arc<SimulationConfig>,
    pub stores: Stores,
    pub forecasts: Arc<dyn ForecastProvider>,
    pub events: Arc<Mutex<EventLog>>,
}

impl AgentContext {
    pub fn new(config: SimulationConfig, stores: Stores, forecasts: Arc<dyn ForecastProvider>) -> Self {
        Self {
            config: Arc::new(config),
            stores,
            forecasts,
            events: Arc::new(Mutex::new(EventLog::new())),
        }
    }

    pub fn log(&self, event: Event) {
        self.events.lock().log(event);
    }
}

/// Reaction of one participant to the day's phases
///
/// `handle` runs synchronously inside the agent's task; phases an agent
/// has nothing to do in return `Ok(())` so the barrier still counts it.
pub trait MarketParticipant: Send {
    fn id(&self) -> &str;

    fn handle(&mut self, phase: Phase, date: NaiveDate, ctx: &AgentContext) -> Result<(), AgentError>;
}

/// Run `agent` until a terminate trigger arrives or a channel closes
pub fn spawn_agent(
    mut agent: Box<dyn MarketParticipant>,
    ctx: AgentContext,
    mut triggers: broadcast::Receiver<Trigger>,
    acks: mpsc::Sender<PhaseAck>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let trigger = match triggers.recv().await {
                Ok(trigger) => trigger,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(agent = agent.id(), skipped, "agent lagged behind triggers");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if trigger.phase == Phase::Terminate {
                debug!(agent = agent.id(), "terminating");
                break;
            }

            // solves are CPU-bound: keep them off the runtime so the
            // controller's phase timeout still fires
            let phase_ctx = ctx.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let status = {
                    let span = agent_span(agent.id(), trigger.phase.as_str());
                    let _entered = span.enter();
                    match agent.handle(trigger.phase, trigger.date, &phase_ctx) {
                        Ok(()) => AckStatus::Completed,
                        Err(error) => {
                            warn!(date = %trigger.date, %error, "phase failed");
                            AckStatus::Failed(error.to_string())
                        }
                    }
                };
                (agent, status)
            })
            .await;
            let status = match outcome {
                Ok((returned, status)) => {
                    agent = returned;
                    status
                }
                Err(error) => {
                    warn!(phase = %trigger.phase, %error, "agent panicked, leaving the run");
                    break;
                }
            };
            let ack = PhaseAck {
                agent_id: agent.id().to_string(),
                phase: trigger.phase,
                date: trigger.date,
                status,
            };
            if acks.send(ack).await.is_err() {
                break;
            }
        }
    })
}

// ============================================================================
// Shared asset-agent steps
// ============================================================================

/// Apply the most recently settled state, if any
fn restore_state(ctx: &AgentContext, asset: &mut Asset) -> Result<(), AgentError> {
    if let Some((closed, state)) = ctx.stores.states.latest_state(asset.id())? {
        debug!(asset = asset.id(), %closed, "state restored");
        asset.set_state(state)?;
    }
    Ok(())
}

/// Persist `book` as the agent's submission for `date`
fn submit(ctx: &AgentContext, date: NaiveDate, agent_id: &str, book: OrderBook) -> Result<(), AgentError> {
    ctx.log(Event::OrdersSubmitted {
        date,
        agent_id: agent_id.to_string(),
        linked: book.linked_asks().len(),
        single: book.single_asks().len(),
        exclusive: book.exclusive_asks().len(),
        bids: book.bids().len(),
    });
    info!(agent = agent_id, %date, orders = book.len(), "orders submitted");
    ctx.stores.orders.set_orders(date, agent_id, book)?;
    Ok(())
}

/// Re-read the stored submission and reject it early when malformed
fn check_submission(ctx: &AgentContext, date: NaiveDate, agent_id: &str) -> Result<(), AgentError> {
    let Some(own) = ctx.stores.orders.get_agent_orders(date, agent_id)? else {
        // A missed bid-building phase is already reported there
        debug!(agent = agent_id, %date, "no submission to check");
        return Ok(());
    };
    if let Some(error) = own.validate().rejected.into_iter().next() {
        ctx.log(Event::OrdersRejected {
            date,
            agent_id: agent_id.to_string(),
            reason: error.to_string(),
        });
        return Err(error.into());
    }
    Ok(())
}

/// Dispatch against the accepted volumes and persist the end state
fn settle_asset(
    ctx: &AgentContext,
    date: NaiveDate,
    asset: &mut Asset,
    forecast: Option<&PriceForecast>,
) -> Result<(), AgentError> {
    let result = ctx
        .stores
        .clearing
        .get_result(date)?
        .ok_or(AgentError::MissingClearing { date })?;
    let fetched;
    let forecast = match forecast {
        Some(forecast) => forecast,
        None => {
            fetched = ctx.forecasts.forecast(date, 1)?;
            &fetched
        }
    };

    let committed = result.agent_volumes(asset.id());
    let settlement = SettlementPostProcessor::new(&ctx.config.optimizer).settle(
        asset,
        &committed,
        &result.prices(),
        &result.aborted_hours(),
        forecast,
    )?;

    match &settlement.skipped {
        Some(reason) => ctx.log(Event::AssetSkipped {
            date,
            agent_id: settlement.agent_id.clone(),
            reason: reason.to_string(),
        }),
        None => ctx.log(Event::DispatchSettled {
            date,
            agent_id: settlement.agent_id.clone(),
            committed_volume: settlement.committed_volume(),
            realized_volume: settlement.realized_volume(),
            profit: settlement.cash_flow.profit,
        }),
    }

    ctx.stores
        .states
        .set_state(date, &settlement.agent_id, settlement.end_state.clone())?;
    let tags: BTreeMap<String, String> = [("agent".to_string(), settlement.agent_id.clone())].into_iter().collect();
    let fields: BTreeMap<String, Vec<f64>> = [
        ("committed".to_string(), settlement.committed.clone()),
        ("realized".to_string(), settlement.realized.clone()),
    ]
    .into_iter()
    .collect();
    ctx.stores.series.write("dispatch", &tags, &fields, &hour_timestamps(date))?;

    // one row per day
    let flow = &settlement.cash_flow;
    let fields: BTreeMap<String, Vec<f64>> = [
        ("revenue", flow.revenue),
        ("purchase", flow.purchase),
        ("fuel", flow.fuel),
        ("emission", flow.emission),
        ("start", flow.start),
        ("profit", flow.profit),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), vec![value]))
    .collect();
    ctx.stores
        .series
        .write("cash_flow", &tags, &fields, &[date.and_time(NaiveTime::MIN)])?;
    Ok(())
}
