//! Event logging for simulation replay and auditing.
//!
//! The Event enum captures every significant outcome of a simulated day:
//! phase transitions, order submissions, rejected books, clearing results,
//! settlement and participation failures. Every event is stamped with the
//! delivery date it belongs to.
//!
//! # Example
//!
//! ```rust
//! use chrono::NaiveDate;
//! use market_simulator_core_rs::models::{Event, EventLog};
//!
//! let date = NaiveDate::from_ymd_opt(2018, 1, 1).unwrap();
//! let mut log = EventLog::new();
//! log.log(Event::OrdersSubmitted {
//!     date,
//!     agent_id: "PWP_1".to_string(),
//!     linked: 24,
//!     single: 0,
//!     exclusive: 0,
//!     bids: 0,
//! });
//!
//! assert_eq!(log.events_on(date).len(), 1);
//! ```

use crate::transport::Phase;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Simulation event capturing a state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Controller broadcast a phase trigger
    PhaseStarted { date: NaiveDate, phase: Phase },

    /// Phase barrier finished (all agents answered or the wait timed out)
    PhaseCompleted {
        date: NaiveDate,
        phase: Phase,
        completed: usize,
        failed: usize,
        missing: usize,
    },

    /// Agent persisted its order book for the day
    OrdersSubmitted {
        date: NaiveDate,
        agent_id: String,
        linked: usize,
        single: usize,
        exclusive: usize,
        bids: usize,
    },

    /// Thermal agent flagged hours where staying on beats a shutdown
    PreventedStart {
        date: NaiveDate,
        agent_id: String,
        hours: Vec<usize>,
        discount: f64,
    },

    /// Agent's orders were removed from the auction
    OrdersRejected {
        date: NaiveDate,
        agent_id: String,
        reason: String,
    },

    /// Auction solved
    MarketCleared {
        date: NaiveDate,
        mean_price: f64,
        traded_volume: f64,
        source_volume: f64,
        sink_volume: f64,
        degraded: bool,
    },

    /// Structural imbalance or empty hour surfaced by clearing
    ClearingWarning { date: NaiveDate, warning: String },

    /// Asset re-optimized against its committed schedule
    DispatchSettled {
        date: NaiveDate,
        agent_id: String,
        committed_volume: f64,
        realized_volume: f64,
        profit: f64,
    },

    /// Asset could not be optimized and dispatches zero for the day
    AssetSkipped {
        date: NaiveDate,
        agent_id: String,
        reason: String,
    },

    /// Agent failed or missed a phase
    ParticipationFailure {
        date: NaiveDate,
        agent_id: String,
        phase: Phase,
        reason: String,
    },
}

impl Event {
    /// Get the delivery date this event belongs to
    pub fn date(&self) -> NaiveDate {
        match self {
            Event::PhaseStarted { date, .. } => *date,
            Event::PhaseCompleted { date, .. } => *date,
            Event::OrdersSubmitted { date, .. } => *date,
            Event::PreventedStart { date, .. } => *date,
            Event::OrdersRejected { date, .. } => *date,
            Event::MarketCleared { date, .. } => *date,
            Event::ClearingWarning { date, .. } => *date,
            Event::DispatchSettled { date, .. } => *date,
            Event::AssetSkipped { date, .. } => *date,
            Event::ParticipationFailure { date, .. } => *date,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Event::PhaseStarted { .. } => "PhaseStarted",
            Event::PhaseCompleted { .. } => "PhaseCompleted",
            Event::OrdersSubmitted { .. } => "OrdersSubmitted",
            Event::PreventedStart { .. } => "PreventedStart",
            Event::OrdersRejected { .. } => "OrdersRejected",
            Event::MarketCleared { .. } => "MarketCleared",
            Event::ClearingWarning { .. } => "ClearingWarning",
            Event::DispatchSettled { .. } => "DispatchSettled",
            Event::AssetSkipped { .. } => "AssetSkipped",
            Event::ParticipationFailure { .. } => "ParticipationFailure",
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Event::OrdersSubmitted { agent_id, .. } => Some(agent_id),
            Event::PreventedStart { agent_id, .. } => Some(agent_id),
            Event::OrdersRejected { agent_id, .. } => Some(agent_id),
            Event::DispatchSettled { agent_id, .. } => Some(agent_id),
            Event::AssetSkipped { agent_id, .. } => Some(agent_id),
            Event::ParticipationFailure { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }
}

/// Event log for storing and querying simulation events.
///
/// This is a simple wrapper around Vec<Event> with convenience methods.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn log(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Get events for a specific delivery date
    pub fn events_on(&self, date: NaiveDate) -> Vec<&Event> {
        self.events.iter().filter(|e| e.date() == date).collect()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.event_type() == event_type)
            .collect()
    }

    pub fn events_for_agent(&self, agent_id: &str) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.agent_id() == Some(agent_id))
            .collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, 1, d).unwrap()
    }

    #[test]
    fn test_filters() {
        let mut log = EventLog::new();
        log.log(Event::PhaseStarted {
            date: date(1),
            phase: Phase::BidBuilding,
        });
        log.log(Event::ParticipationFailure {
            date: date(1),
            agent_id: "STO_1".to_string(),
            phase: Phase::BidBuilding,
            reason: "submission timeout".to_string(),
        });
        log.log(Event::PhaseStarted {
            date: date(2),
            phase: Phase::BidBuilding,
        });

        assert_eq!(log.len(), 3);
        assert_eq!(log.events_on(date(1)).len(), 2);
        assert_eq!(log.events_of_type("PhaseStarted").len(), 2);
        assert_eq!(log.events_for_agent("STO_1").len(), 1);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = Event::ClearingWarning {
            date: date(3),
            warning: "magic source used in hour 4".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ClearingWarning");
    }
}
