//! Domain models for the market simulator

pub mod asset;
pub mod event;
pub mod forecast;
pub mod order;

// Re-exports
pub use asset::{Asset, AssetError, AssetKind, AssetState};
pub use event::{Event, EventLog};
pub use forecast::{DayForecast, ForecastError, ForecastProvider, PriceForecast, StaticForecast};
pub use order::{OrderBook, OrderBookError};
