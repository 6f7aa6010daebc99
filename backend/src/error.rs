//! Crate-level error
//!
//! Subsystems keep their own error enums; this one wraps them for callers
//! that drive a whole simulation.

use crate::agents::AgentError;
use crate::config::ConfigError;
use crate::models::asset::AssetError;
use crate::models::forecast::ForecastError;
use crate::models::order::OrderBookError;
use crate::optimizer::OptimizationError;
use crate::orchestrator::checkpoint::CheckpointError;
use crate::orchestrator::controller::ParticipationFailure;
use crate::settlement::SettlementError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Forecast(#[from] ForecastError),

    #[error(transparent)]
    Optimization(#[from] OptimizationError),

    #[error(transparent)]
    OrderBook(#[from] OrderBookError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Participation(#[from] ParticipationFailure),
}
