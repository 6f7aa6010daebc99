//! Order and order book model
//!
//! Every order is identified by a strongly typed composite [`OrderKey`]
//! `{block_id, hour, order_id, agent_id}` whose derived ordering is the
//! canonical iteration order of the book. Clearing tie-breaks depend on it.
//!
//! # Order kinds
//!
//! - **Single ask / bid**: one `(hour, agent)` entry. Asks are accepted as a
//!   continuous fraction, bids are always cleared in full.
//! - **Linked ask**: forms a forest per agent. Root blocks ("mother" orders)
//!   have no parent and are accepted all-or-nothing; every other block names a
//!   parent block of the same agent and its activation is capped by the
//!   parent's aggregate activation.
//! - **Exclusive ask**: a block spanning the whole day; at most one block per
//!   agent is selected. Negative volumes are consumption (charging).
//!
//! # Critical Invariants
//!
//! 1. Hours are in `0..HOURS_PER_DAY`
//! 2. Prices and volumes are finite
//! 3. Linked blocks of one agent are numbered contiguously from 0 and form an
//!    acyclic forest whose parents exist
//!
//! A book violating any of these for some agent has that agent's orders
//! removed by [`OrderBook::validate`].

use crate::core::time::HOURS_PER_DAY;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Reasons an agent's orders are rejected before clearing
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrderBookError {
    #[error("{agent_id}: hour {hour} outside delivery day")]
    HourOutOfRange { agent_id: String, hour: usize },

    #[error("{agent_id}: non-finite price or volume in block {block_id}")]
    NonFinite { agent_id: String, block_id: u32 },

    #[error("{agent_id}: ask volume must be positive in block {block_id}, got {volume}")]
    NonPositiveVolume {
        agent_id: String,
        block_id: u32,
        volume: f64,
    },

    #[error("{agent_id}: bid volume must not be negative in hour {hour}")]
    NegativeBid { agent_id: String, hour: usize },

    #[error("{agent_id}: block {block_id} references unknown parent {parent}")]
    UnknownParent {
        agent_id: String,
        block_id: u32,
        parent: u32,
    },

    #[error("{agent_id}: block {block_id} declares different parents")]
    InconsistentParent { agent_id: String, block_id: u32 },

    #[error("{agent_id}: block {block_id} is part of a parent cycle")]
    Cycle { agent_id: String, block_id: u32 },

    #[error("{agent_id}: linked block ids are not contiguous from 0")]
    NonContiguousBlocks { agent_id: String },
}

impl OrderBookError {
    /// Agent whose orders were rejected
    pub fn agent_id(&self) -> &str {
        match self {
            OrderBookError::HourOutOfRange { agent_id, .. }
            | OrderBookError::NonFinite { agent_id, .. }
            | OrderBookError::NonPositiveVolume { agent_id, .. }
            | OrderBookError::NegativeBid { agent_id, .. }
            | OrderBookError::UnknownParent { agent_id, .. }
            | OrderBookError::InconsistentParent { agent_id, .. }
            | OrderBookError::Cycle { agent_id, .. }
            | OrderBookError::NonContiguousBlocks { agent_id } => agent_id,
        }
    }
}

// ============================================================================
// Keys and values
// ============================================================================

/// Composite order identity with canonical ordering
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub block_id: u32,
    pub hour: usize,
    pub order_id: u32,
    pub agent_id: String,
}

impl OrderKey {
    pub fn new(block_id: u32, hour: usize, order_id: u32, agent_id: impl Into<String>) -> Self {
        Self {
            block_id,
            hour,
            order_id,
            agent_id: agent_id.into(),
        }
    }

    /// Key of a single hourly order (ask or bid)
    pub fn single(hour: usize, agent_id: impl Into<String>) -> Self {
        Self::new(0, hour, 0, agent_id)
    }
}

/// Price/volume pair of a single or exclusive order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// €/MWh
    pub price: f64,
    /// MW; negative only for exclusive consumption
    pub volume: f64,
}

impl Order {
    pub fn new(price: f64, volume: f64) -> Self {
        Self { price, volume }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkedOrder {
    pub price: f64,
    pub volume: f64,
    /// Parent block of the same agent, `None` for a mother block
    pub parent: Option<u32>,
}

impl LinkedOrder {
    pub fn new(price: f64, volume: f64, parent: Option<u32>) -> Self {
        Self {
            price,
            volume,
            parent,
        }
    }

    pub fn is_mother(&self) -> bool {
        self.parent.is_none()
    }
}

/// Serialize keyed maps as entry lists (JSON object keys must be strings)
pub(crate) mod keyed_entries {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        K: Serialize,
        V: Serialize,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
    {
        let entries: Vec<(K, V)> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

// ============================================================================
// Order book
// ============================================================================

/// Keys of every order touching one hour
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HourIndex {
    pub single_asks: Vec<OrderKey>,
    pub linked_asks: Vec<OrderKey>,
    pub exclusive_asks: Vec<OrderKey>,
    pub bids: Vec<OrderKey>,
}

impl HourIndex {
    pub fn has_asks(&self) -> bool {
        !(self.single_asks.is_empty() && self.linked_asks.is_empty() && self.exclusive_asks.is_empty())
    }

    pub fn has_bids(&self) -> bool {
        !self.bids.is_empty()
    }
}

/// Offered and requested volume in one hour
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HourSummary {
    pub ask_volume: f64,
    pub bid_volume: f64,
    pub min_ask_price: Option<f64>,
    pub max_ask_price: Option<f64>,
}

/// Outcome of [`OrderBook::validate`]
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBook {
    pub book: OrderBook,
    /// One entry per removed agent with the first problem found
    pub rejected: Vec<OrderBookError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    #[serde(with = "keyed_entries")]
    single_asks: BTreeMap<OrderKey, Order>,
    #[serde(with = "keyed_entries")]
    linked_asks: BTreeMap<OrderKey, LinkedOrder>,
    #[serde(with = "keyed_entries")]
    exclusive_asks: BTreeMap<OrderKey, Order>,
    #[serde(with = "keyed_entries")]
    bids: BTreeMap<OrderKey, Order>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_single_ask(&mut self, hour: usize, agent_id: &str, order: Order) {
        self.single_asks.insert(OrderKey::single(hour, agent_id), order);
    }

    pub fn add_linked(&mut self, key: OrderKey, order: LinkedOrder) {
        self.linked_asks.insert(key, order);
    }

    pub fn add_exclusive(&mut self, block_id: u32, hour: usize, agent_id: &str, order: Order) {
        self.exclusive_asks
            .insert(OrderKey::new(block_id, hour, 0, agent_id), order);
    }

    pub fn add_bid(&mut self, hour: usize, agent_id: &str, order: Order) {
        self.bids.insert(OrderKey::single(hour, agent_id), order);
    }

    pub fn single_asks(&self) -> &BTreeMap<OrderKey, Order> {
        &self.single_asks
    }

    pub fn linked_asks(&self) -> &BTreeMap<OrderKey, LinkedOrder> {
        &self.linked_asks
    }

    pub fn exclusive_asks(&self) -> &BTreeMap<OrderKey, Order> {
        &self.exclusive_asks
    }

    pub fn bids(&self) -> &BTreeMap<OrderKey, Order> {
        &self.bids
    }

    pub fn is_empty(&self) -> bool {
        self.single_asks.is_empty()
            && self.linked_asks.is_empty()
            && self.exclusive_asks.is_empty()
            && self.bids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.single_asks.len() + self.linked_asks.len() + self.exclusive_asks.len() + self.bids.len()
    }

    /// Copy every order of `other` into this book
    ///
    /// Agents submit separate books; the market pools them with this.
    pub fn merge(&mut self, other: &OrderBook) {
        self.single_asks
            .extend(other.single_asks.iter().map(|(k, v)| (k.clone(), *v)));
        self.linked_asks
            .extend(other.linked_asks.iter().map(|(k, v)| (k.clone(), *v)));
        self.exclusive_asks
            .extend(other.exclusive_asks.iter().map(|(k, v)| (k.clone(), *v)));
        self.bids.extend(other.bids.iter().map(|(k, v)| (k.clone(), *v)));
    }

    /// All agents with at least one order, in canonical order
    pub fn agents(&self) -> BTreeSet<String> {
        self.single_asks
            .keys()
            .chain(self.linked_asks.keys())
            .chain(self.exclusive_asks.keys())
            .chain(self.bids.keys())
            .map(|k| k.agent_id.clone())
            .collect()
    }

    /// Per-hour reverse index over all order kinds
    pub fn hour_index(&self) -> Vec<HourIndex> {
        let mut index = vec![HourIndex::default(); HOURS_PER_DAY];
        for key in self.single_asks.keys() {
            if let Some(entry) = index.get_mut(key.hour) {
                entry.single_asks.push(key.clone());
            }
        }
        for key in self.linked_asks.keys() {
            if let Some(entry) = index.get_mut(key.hour) {
                entry.linked_asks.push(key.clone());
            }
        }
        for (key, order) in &self.exclusive_asks {
            let Some(entry) = index.get_mut(key.hour) else {
                continue;
            };
            // charging hours sit on the demand side, idle hours on neither
            if order.volume > 0.0 {
                entry.exclusive_asks.push(key.clone());
            } else if order.volume < 0.0 {
                entry.bids.push(key.clone());
            }
        }
        for key in self.bids.keys() {
            if let Some(entry) = index.get_mut(key.hour) {
                entry.bids.push(key.clone());
            }
        }
        index
    }

    /// Offered and requested volume per hour
    pub fn summary(&self) -> Vec<HourSummary> {
        let mut summary = vec![HourSummary::default(); HOURS_PER_DAY];
        let asks = self
            .single_asks
            .iter()
            .chain(self.exclusive_asks.iter())
            .map(|(k, o)| (k.hour, o.price, o.volume))
            .chain(self.linked_asks.iter().map(|(k, o)| (k.hour, o.price, o.volume)));
        for (hour, price, volume) in asks {
            let Some(entry) = summary.get_mut(hour) else {
                continue;
            };
            if volume < 0.0 {
                entry.bid_volume -= volume;
                continue;
            }
            entry.ask_volume += volume;
            entry.min_ask_price = Some(entry.min_ask_price.map_or(price, |p| p.min(price)));
            entry.max_ask_price = Some(entry.max_ask_price.map_or(price, |p| p.max(price)));
        }
        for (key, bid) in &self.bids {
            if let Some(entry) = summary.get_mut(key.hour) {
                entry.bid_volume += bid.volume;
            }
        }
        summary
    }

    /// Orders of one agent only
    pub fn for_agent(&self, agent_id: &str) -> OrderBook {
        let pick = |k: &OrderKey| k.agent_id == agent_id;
        OrderBook {
            single_asks: retain_keys(&self.single_asks, pick),
            linked_asks: retain_keys(&self.linked_asks, pick),
            exclusive_asks: retain_keys(&self.exclusive_asks, pick),
            bids: retain_keys(&self.bids, pick),
        }
    }

    /// Remove every agent whose orders break the book invariants
    pub fn validate(&self) -> ValidatedBook {
        let mut rejected = Vec::new();
        let mut dropped = BTreeSet::new();
        for agent in self.agents() {
            if let Err(err) = self.for_agent(&agent).check_agent(&agent) {
                rejected.push(err);
                dropped.insert(agent);
            }
        }

        let keep = |k: &OrderKey| !dropped.contains(&k.agent_id);
        let book = OrderBook {
            single_asks: retain_keys(&self.single_asks, keep),
            linked_asks: retain_keys(&self.linked_asks, keep),
            exclusive_asks: retain_keys(&self.exclusive_asks, keep),
            bids: retain_keys(&self.bids, keep),
        };
        ValidatedBook { book, rejected }
    }

    fn check_agent(&self, agent_id: &str) -> Result<(), OrderBookError> {
        let agent = || agent_id.to_string();
        let all_keys = self
            .single_asks
            .keys()
            .chain(self.linked_asks.keys())
            .chain(self.exclusive_asks.keys())
            .chain(self.bids.keys());
        for key in all_keys {
            if key.hour >= HOURS_PER_DAY {
                return Err(OrderBookError::HourOutOfRange {
                    agent_id: agent(),
                    hour: key.hour,
                });
            }
        }

        let plain = self
            .single_asks
            .iter()
            .chain(self.exclusive_asks.iter())
            .chain(self.bids.iter())
            .map(|(k, o)| (k, o.price, o.volume))
            .chain(self.linked_asks.iter().map(|(k, o)| (k, o.price, o.volume)));
        for (key, price, volume) in plain {
            if !(price.is_finite() && volume.is_finite()) {
                return Err(OrderBookError::NonFinite {
                    agent_id: agent(),
                    block_id: key.block_id,
                });
            }
        }

        for (key, order) in self.single_asks.iter() {
            if order.volume <= 0.0 {
                return Err(OrderBookError::NonPositiveVolume {
                    agent_id: agent(),
                    block_id: key.block_id,
                    volume: order.volume,
                });
            }
        }
        for (key, order) in self.linked_asks.iter() {
            if order.volume <= 0.0 {
                return Err(OrderBookError::NonPositiveVolume {
                    agent_id: agent(),
                    block_id: key.block_id,
                    volume: order.volume,
                });
            }
        }
        for (key, bid) in &self.bids {
            if bid.volume < 0.0 {
                return Err(OrderBookError::NegativeBid {
                    agent_id: agent(),
                    hour: key.hour,
                });
            }
        }

        self.check_forest(agent_id)
    }

    /// Linked blocks must be contiguous from 0, agree on their parent and
    /// form an acyclic forest
    fn check_forest(&self, agent_id: &str) -> Result<(), OrderBookError> {
        let parents = block_parents(&self.linked_asks).map_err(|block_id| {
            OrderBookError::InconsistentParent {
                agent_id: agent_id.to_string(),
                block_id,
            }
        })?;
        if parents.is_empty() {
            return Ok(());
        }

        let contiguous = parents.keys().copied().eq(0..parents.len() as u32);
        if !contiguous {
            return Err(OrderBookError::NonContiguousBlocks {
                agent_id: agent_id.to_string(),
            });
        }

        for (&block_id, parent) in &parents {
            if let Some(parent) = parent {
                if !parents.contains_key(parent) {
                    return Err(OrderBookError::UnknownParent {
                        agent_id: agent_id.to_string(),
                        block_id,
                        parent: *parent,
                    });
                }
            }
        }

        for &start in parents.keys() {
            let mut current = start;
            let mut steps = 0;
            while let Some(Some(parent)) = parents.get(&current) {
                current = *parent;
                steps += 1;
                if steps > parents.len() {
                    return Err(OrderBookError::Cycle {
                        agent_id: agent_id.to_string(),
                        block_id: start,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Parent of every linked block of one agent, `Err(block)` when its orders
/// disagree
pub(crate) fn block_parents(
    linked: &BTreeMap<OrderKey, LinkedOrder>,
) -> Result<BTreeMap<u32, Option<u32>>, u32> {
    let mut parents: BTreeMap<u32, Option<u32>> = BTreeMap::new();
    for (key, order) in linked {
        match parents.get(&key.block_id) {
            Some(existing) if *existing != order.parent => return Err(key.block_id),
            Some(_) => {}
            None => {
                parents.insert(key.block_id, order.parent);
            }
        }
    }
    Ok(parents)
}

fn retain_keys<V: Clone>(
    map: &BTreeMap<OrderKey, V>,
    keep: impl Fn(&OrderKey) -> bool,
) -> BTreeMap<OrderKey, V> {
    map.iter()
        .filter(|(k, _)| keep(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked(book: &mut OrderBook, agent: &str, block: u32, hour: usize, parent: Option<u32>) {
        book.add_linked(
            OrderKey::new(block, hour, 0, agent),
            LinkedOrder::new(30.0, 10.0, parent),
        );
    }

    #[test]
    fn test_key_ordering_is_block_first() {
        let a = OrderKey::new(0, 23, 0, "Z");
        let b = OrderKey::new(1, 0, 0, "A");
        assert!(a < b);
    }

    #[test]
    fn test_validate_keeps_valid_forest() {
        let mut book = OrderBook::new();
        linked(&mut book, "PWP", 0, 5, None);
        linked(&mut book, "PWP", 1, 5, Some(0));
        linked(&mut book, "PWP", 2, 6, Some(1));
        let validated = book.validate();
        assert!(validated.rejected.is_empty());
        assert_eq!(validated.book.linked_asks().len(), 3);
    }

    #[test]
    fn test_validate_drops_unknown_parent() {
        let mut book = OrderBook::new();
        linked(&mut book, "BAD", 0, 5, None);
        linked(&mut book, "BAD", 1, 5, Some(7));
        linked(&mut book, "OK", 0, 5, None);
        let validated = book.validate();
        assert_eq!(validated.rejected.len(), 1);
        assert!(matches!(
            validated.rejected[0],
            OrderBookError::UnknownParent { parent: 7, .. }
        ));
        assert_eq!(validated.book.agents().len(), 1);
    }

    #[test]
    fn test_validate_drops_cycle() {
        let mut book = OrderBook::new();
        linked(&mut book, "CYC", 0, 1, Some(1));
        linked(&mut book, "CYC", 1, 1, Some(0));
        let validated = book.validate();
        assert!(matches!(validated.rejected[0], OrderBookError::Cycle { .. }));
        assert!(validated.book.is_empty());
    }

    #[test]
    fn test_validate_drops_gap_in_block_ids() {
        let mut book = OrderBook::new();
        linked(&mut book, "GAP", 0, 1, None);
        linked(&mut book, "GAP", 2, 1, Some(0));
        let validated = book.validate();
        assert!(matches!(
            validated.rejected[0],
            OrderBookError::NonContiguousBlocks { .. }
        ));
    }

    #[test]
    fn test_validate_drops_hour_out_of_range() {
        let mut book = OrderBook::new();
        book.add_bid(24, "DEM", Order::new(3000.0, 10.0));
        let validated = book.validate();
        assert!(matches!(
            validated.rejected[0],
            OrderBookError::HourOutOfRange { hour: 24, .. }
        ));
    }

    #[test]
    fn test_hour_index_puts_charging_on_bid_side() {
        let mut book = OrderBook::new();
        book.add_exclusive(0, 3, "STO", Order::new(20.0, -50.0));
        book.add_exclusive(0, 18, "STO", Order::new(60.0, 40.0));
        let index = book.hour_index();
        assert!(index[3].has_bids());
        assert!(!index[3].has_asks());
        assert!(index[18].has_asks());
    }

    #[test]
    fn test_serde_roundtrip_preserves_keys() {
        let mut book = OrderBook::new();
        linked(&mut book, "PWP", 0, 5, None);
        book.add_bid(5, "DEM", Order::new(3000.0, 10.0));
        let json = serde_json::to_string(&book).unwrap();
        let back: OrderBook = serde_json::from_str(&json).unwrap();
        assert_eq!(back, book);
    }
}
