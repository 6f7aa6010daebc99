//! Order construction
//!
//! Turns optimizer output into orders:
//!
//! - **linked**: thermal step schedules become a forest of linked blocks
//! - **exclusive**: storage scenario schedules become exclusive blocks

pub mod exclusive;
pub mod linked;

pub use exclusive::ExclusiveOrderBuilder;
pub use linked::OrderBookBuilder;
