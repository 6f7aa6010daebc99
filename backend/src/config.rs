//! Simulation configuration
//!
//! All tunable constants of the market live here, grouped by the component
//! that consumes them. Every section has documented defaults; a JSON file
//! can override any subset of fields.
//!
//! # Example
//!
//! ```rust
//! use market_simulator_core_rs::config::SimulationConfig;
//!
//! let config: SimulationConfig =
//!     serde_json::from_str(r#"{ "market": { "max_price": 1000.0 } }"#).unwrap();
//! assert_eq!(config.market.max_price, 1000.0);
//! assert_eq!(config.market.min_price, -500.0);
//! config.validate().unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming a JSON configuration file
pub const CONFIG_ENV: &str = "DAM_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Price perturbation applied to the forecast for one bid step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceStep {
    /// Add a constant to every hourly forecast price (€/MWh)
    Offset(f64),
    /// Price every hour at `BiddingConfig::run_at_max_price`
    RunAtMax,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiddingConfig {
    /// Perturbed price curves solved for bid construction
    pub price_steps: Vec<PriceStep>,

    /// Hourly price used by the run-at-max step (€/MWh)
    pub run_at_max_price: f64,

    /// Number of equal sub-orders per stacked hourly delta
    pub sub_orders: usize,

    /// Relative objective gain above which a shutdown is prevented
    pub prevented_start_threshold: f64,

    /// Share of the gain passed on as price discount
    pub prevented_start_share: f64,

    /// Deltas below this volume are not offered (MW)
    pub min_order_volume: f64,
}

impl Default for BiddingConfig {
    fn default() -> Self {
        Self {
            price_steps: vec![
                PriceStep::Offset(-10.0),
                PriceStep::Offset(-5.0),
                PriceStep::Offset(0.0),
                PriceStep::Offset(5.0),
                PriceStep::Offset(100.0),
                PriceStep::RunAtMax,
            ],
            run_at_max_price: 10_000.0,
            sub_orders: 5,
            prevented_start_threshold: 0.05, // 5% materiality
            prevented_start_share: 1.0,
            min_order_volume: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Regulatory price floor (€/MWh)
    pub min_price: f64,

    /// Regulatory price cap, also the price of inflexible demand (€/MWh)
    pub max_price: f64,

    /// Cost of unserved demand or surplus supply (€/MWh)
    pub penalty_price: f64,

    /// Largest number of block combinations searched exhaustively
    pub exhaustive_limit: usize,

    /// Local search passes before a result is flagged degraded
    pub max_search_passes: usize,

    /// Volumes and activations below this are treated as zero
    pub tolerance: f64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            min_price: -500.0,
            max_price: 3_000.0,
            penalty_price: 20_000.0,
            exhaustive_limit: 4_096,
            max_search_passes: 64,
            tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Intervals between min and max power in the thermal power grid
    pub power_levels: usize,

    /// Intervals between min and max volume in the storage volume grid
    pub volume_levels: usize,

    /// Lower bound of the deviation price in post-market dispatch (€/MWh)
    pub deviation_penalty_floor: f64,

    /// Target end-of-day volume as share of capacity
    pub storage_terminal_share: f64,

    /// Hours a price shape scenario is shifted by
    pub scenario_shift_hours: usize,

    /// Powers below this are treated as off (MW)
    pub tolerance: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            power_levels: 20,
            volume_levels: 48,
            deviation_penalty_floor: 1_000.0,
            storage_terminal_share: 0.5,
            scenario_shift_hours: 1,
            tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Bounded wait for all agents to finish a phase (ms)
    pub phase_timeout_ms: u64,

    /// Final re-check after the timeout elapsed (ms)
    pub grace_ms: u64,

    /// Broadcast buffer per subscriber
    pub channel_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            phase_timeout_ms: 90_000,
            grace_ms: 5_000,
            channel_capacity: 64,
        }
    }
}

impl ControllerConfig {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Complete simulation configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub bidding: BiddingConfig,
    pub market: MarketConfig,
    pub optimizer: OptimizerConfig,
    pub controller: ControllerConfig,
}

impl SimulationConfig {
    /// Defaults, overridden by the JSON file named in `DAM_CONFIG` if set
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the models meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: String| Err(ConfigError::Invalid { field, reason });

        if self.bidding.price_steps.is_empty() {
            return invalid("bidding.price_steps", "at least one step required".into());
        }
        if self.bidding.sub_orders == 0 {
            return invalid("bidding.sub_orders", "must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.bidding.prevented_start_share) {
            return invalid(
                "bidding.prevented_start_share",
                format!("must lie in [0, 1], got {}", self.bidding.prevented_start_share),
            );
        }
        if self.market.min_price >= self.market.max_price {
            return invalid(
                "market.min_price",
                format!(
                    "must be below max_price ({} >= {})",
                    self.market.min_price, self.market.max_price
                ),
            );
        }
        if self.market.penalty_price <= self.market.max_price {
            return invalid(
                "market.penalty_price",
                format!(
                    "must exceed max_price {}, got {}",
                    self.market.max_price, self.market.penalty_price
                ),
            );
        }
        if self.market.exhaustive_limit == 0 {
            return invalid("market.exhaustive_limit", "must be at least 1".into());
        }
        if self.optimizer.power_levels == 0 || self.optimizer.volume_levels == 0 {
            return invalid("optimizer.power_levels", "grids need at least one interval".into());
        }
        if self.optimizer.deviation_penalty_floor <= 0.0 {
            return invalid(
                "optimizer.deviation_penalty_floor",
                format!("must be positive, got {}", self.optimizer.deviation_penalty_floor),
            );
        }
        if !(0.0..=1.0).contains(&self.optimizer.storage_terminal_share) {
            return invalid(
                "optimizer.storage_terminal_share",
                format!("must lie in [0, 1], got {}", self.optimizer.storage_terminal_share),
            );
        }
        Ok(())
    }
}
