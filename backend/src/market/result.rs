//! Clearing outcome

use crate::core::time::HOURS_PER_DAY;
use crate::models::order::OrderKey;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearingStatus {
    /// Best block combination found (exhaustive search or converged local search)
    Optimal,
    /// Local search hit its pass budget; the result is feasible but may not
    /// be the cheapest
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClearingWarning {
    NoAsks { hour: usize },
    NoBids { hour: usize },
    /// Demand not covered by any ask
    MagicSourceUsed { hour: usize, volume: f64 },
    /// Supply forced into the market beyond demand
    MagicSinkUsed { hour: usize, volume: f64 },
}

impl ClearingWarning {
    pub fn hour(&self) -> usize {
        match self {
            ClearingWarning::NoAsks { hour }
            | ClearingWarning::NoBids { hour }
            | ClearingWarning::MagicSourceUsed { hour, .. }
            | ClearingWarning::MagicSinkUsed { hour, .. } => *hour,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Single,
    Linked,
    Exclusive,
    Bid,
}

/// Realized activation of one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acceptance {
    pub key: OrderKey,
    pub kind: OrderKind,
    pub price: f64,
    /// Offered volume, negative for exclusive consumption
    pub volume: f64,
    /// Accepted share in [0, 1]
    pub activation: f64,
}

impl Acceptance {
    pub fn accepted_volume(&self) -> f64 {
        self.volume * self.activation
    }
}

/// Aggregate activation of one linked block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockActivation {
    pub agent_id: String,
    pub block_id: u32,
    pub parent: Option<u32>,
    /// Accepted volume over offered volume across all hours of the block
    pub activation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourResult {
    pub hour: usize,
    pub price: f64,
    /// Accepted supply including exclusive discharge (MW)
    pub supply: f64,
    /// Cleared bids including exclusive charging (MW)
    pub demand: f64,
    pub source: f64,
    pub sink: f64,
}

/// Agent dropped from the auction before clearing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub agent_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearingResult {
    pub date: NaiveDate,
    pub status: ClearingStatus,
    /// Generation cost plus source/sink penalties of the chosen solution
    pub objective: f64,
    pub hours: Vec<HourResult>,
    pub acceptances: Vec<Acceptance>,
    pub blocks: Vec<BlockActivation>,
    pub warnings: Vec<ClearingWarning>,
    pub rejected: Vec<Rejection>,
}

impl ClearingResult {
    pub fn prices(&self) -> Vec<f64> {
        self.hours.iter().map(|h| h.price).collect()
    }

    pub fn mean_price(&self) -> f64 {
        if self.hours.is_empty() {
            return 0.0;
        }
        self.hours.iter().map(|h| h.price).sum::<f64>() / self.hours.len() as f64
    }

    pub fn traded_volume(&self) -> f64 {
        self.hours.iter().map(|h| h.supply).sum()
    }

    pub fn source_volume(&self) -> f64 {
        self.hours.iter().map(|h| h.source).sum()
    }

    pub fn sink_volume(&self) -> f64 {
        self.hours.iter().map(|h| h.sink).sum()
    }

    /// Net accepted volume of `agent_id` per hour, supply positive
    ///
    /// Bids count as consumption, so a demand agent gets a negative series.
    pub fn agent_volumes(&self, agent_id: &str) -> Vec<f64> {
        let mut volumes = vec![0.0; HOURS_PER_DAY];
        for acceptance in self.acceptances.iter().filter(|a| a.key.agent_id == agent_id) {
            let Some(slot) = volumes.get_mut(acceptance.key.hour) else {
                continue;
            };
            match acceptance.kind {
                OrderKind::Bid => *slot -= acceptance.accepted_volume(),
                _ => *slot += acceptance.accepted_volume(),
            }
        }
        volumes
    }

    /// Selected exclusive block per agent
    pub fn selected_exclusive_blocks(&self) -> BTreeMap<String, u32> {
        self.acceptances
            .iter()
            .filter(|a| a.kind == OrderKind::Exclusive && a.activation > 0.0)
            .map(|a| (a.key.agent_id.clone(), a.key.block_id))
            .collect()
    }

    /// Hours without asks or without bids; settlement skips them
    pub fn aborted_hours(&self) -> BTreeSet<usize> {
        self.warnings
            .iter()
            .filter(|w| matches!(w, ClearingWarning::NoAsks { .. } | ClearingWarning::NoBids { .. }))
            .map(ClearingWarning::hour)
            .collect()
    }

    pub fn block_activation(&self, agent_id: &str, block_id: u32) -> Option<f64> {
        self.blocks
            .iter()
            .find(|b| b.agent_id == agent_id && b.block_id == block_id)
            .map(|b| b.activation)
    }
}
