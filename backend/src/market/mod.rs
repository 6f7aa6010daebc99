//! Day-ahead market clearing
//!
//! - **clearing**: [`MarketClearingEngine`], the combinatorial auction
//! - **result**: [`ClearingResult`] and its per-hour / per-order views

pub mod clearing;
pub mod result;

pub use clearing::MarketClearingEngine;
pub use result::{
    Acceptance, BlockActivation, ClearingResult, ClearingStatus, ClearingWarning, HourResult, OrderKind,
    Rejection,
};
