//! Market Simulator Core - Rust Engine
//!
//! Agent-based simulator of a day-ahead electricity market.
//!
//! # Architecture
//!
//! - **core**: Clock and delivery hours
//! - **models**: Domain types (assets, forecasts, orders, events)
//! - **optimizer**: Unit commitment and storage dispatch
//! - **bidding**: Turning optimal schedules into linked and exclusive orders
//! - **market**: Block-order clearing and price discovery
//! - **settlement**: Post-market re-dispatch and cash flows
//! - **agents**: Market participants reacting to phase triggers
//! - **orchestrator**: Day cycle controller and checkpoints
//! - **store**: Order book, clearing, state and time series persistence
//!
//! # Critical Invariants
//!
//! 1. Every cleared hour balances supply and demand, with penalized slack
//! 2. A child block is never activated beyond its parent
//! 3. One agent failing never stops the day

// Module declarations
pub mod agents;
pub mod bidding;
pub mod config;
pub mod core;
pub mod error;
pub mod logger;
pub mod market;
pub mod models;
pub mod optimizer;
pub mod orchestrator;
pub mod settlement;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use agents::{AgentContext, AgentError, DemandAgent, MarketAgent, MarketParticipant, StorageAgent, ThermalAgent};
pub use bidding::{ExclusiveOrderBuilder, OrderBookBuilder};
pub use config::{ConfigError, SimulationConfig};
pub use core::time::{SimulationClock, HOURS_PER_DAY};
pub use error::SimulationError;
pub use market::{ClearingResult, ClearingStatus, MarketClearingEngine};
pub use models::{
    asset::{Asset, AssetState, StorageAsset, ThermalAsset},
    event::{Event, EventLog},
    order::OrderBook,
};
pub use optimizer::{StorageOptimizer, UnitCommitmentOptimizer};
pub use orchestrator::{DayCycleController, DayReport, MarketSimulation, SimulationSnapshot};
pub use settlement::{Settlement, SettlementPostProcessor};
pub use store::{InMemoryStore, Stores};
pub use transport::Phase;
