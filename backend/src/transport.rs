//! Phase triggers and acknowledgements
//!
//! The controller publishes one [`Trigger`] per phase on a broadcast
//! channel; every agent task receives its own copy and answers with a
//! [`PhaseAck`] on a shared mpsc channel.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, mpsc};

/// Steps of one simulated day, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Agents load their physical state
    AwaitCapacity,
    /// Agents optimize and store their order books
    BidBuilding,
    /// Agents confirm their stored books are well formed
    BidSubmitted,
    /// The market agent clears the pooled book
    Clearing,
    /// Agents dispatch against their accepted volumes
    Settlement,
    /// Day closed; agents drop per-day caches
    NextDay,
    /// Agents leave their loop
    Terminate,
}

impl Phase {
    /// Phases of a regular day
    pub const DAY: [Phase; 6] = [
        Phase::AwaitCapacity,
        Phase::BidBuilding,
        Phase::BidSubmitted,
        Phase::Clearing,
        Phase::Settlement,
        Phase::NextDay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::AwaitCapacity => "await_capacity",
            Phase::BidBuilding => "bid_building",
            Phase::BidSubmitted => "bid_submitted",
            Phase::Clearing => "clearing",
            Phase::Settlement => "settlement",
            Phase::NextDay => "next_day",
            Phase::Terminate => "terminate",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub phase: Phase,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseAck {
    pub agent_id: String,
    pub phase: Phase,
    pub date: NaiveDate,
    pub status: AckStatus,
}

/// Fan-out of phase triggers
#[derive(Debug, Clone)]
pub struct Broadcast {
    sender: broadcast::Sender<Trigger>,
}

impl Broadcast {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Send `trigger` to every subscriber, returning how many received it
    pub fn publish(&self, trigger: Trigger) -> usize {
        self.sender.send(trigger).unwrap_or(0)
    }

    /// Receiver for triggers published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Trigger> {
        self.sender.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Channel carrying acknowledgements back to the controller
pub fn ack_channel(capacity: usize) -> (mpsc::Sender<PhaseAck>, mpsc::Receiver<PhaseAck>) {
    mpsc::channel(capacity.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_trigger() {
        let broadcast = Broadcast::new(8);
        let mut first = broadcast.subscribe();
        let mut second = broadcast.subscribe();
        let trigger = Trigger {
            phase: Phase::Clearing,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        };
        assert_eq!(broadcast.publish(trigger), 2);
        assert_eq!(first.recv().await.unwrap(), trigger);
        assert_eq!(second.recv().await.unwrap(), trigger);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broadcast = Broadcast::new(8);
        let trigger = Trigger {
            phase: Phase::Terminate,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        };
        assert_eq!(broadcast.publish(trigger), 0);
    }

    #[test]
    fn test_day_phases_ordered() {
        assert!(Phase::DAY.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(Phase::BidSubmitted.to_string(), "bid_submitted");
    }
}
