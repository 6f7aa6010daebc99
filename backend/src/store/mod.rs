//! Persistence seams
//!
//! Agents and the market exchange order books, clearing results and asset
//! states through these traits rather than through each other. The
//! in-memory implementation backs tests and single-process runs; a
//! database-backed one only has to implement the same traits.
//!
//! All writes of one day are keyed per `(date, agent)`, so concurrent agents
//! never overwrite each other.

use crate::market::ClearingResult;
use crate::models::asset::AssetState;
use crate::models::order::OrderBook;
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{series}: {values} values for {timestamps} timestamps")]
    Misaligned {
        series: String,
        values: usize,
        timestamps: usize,
    },
}

pub trait OrderBookStore: Send + Sync {
    /// Replace the orders `agent_id` submitted for `date`
    fn set_orders(&self, date: NaiveDate, agent_id: &str, book: OrderBook) -> Result<(), StoreError>;

    /// All orders submitted for `date`, merged into one book
    fn get_orders(&self, date: NaiveDate) -> Result<OrderBook, StoreError>;

    /// The book `agent_id` submitted for `date`, if any
    fn get_agent_orders(&self, date: NaiveDate, agent_id: &str) -> Result<Option<OrderBook>, StoreError>;

    fn list_agents(&self, date: NaiveDate) -> Result<Vec<String>, StoreError>;
}

pub trait ClearingStore: Send + Sync {
    fn set_result(&self, result: ClearingResult) -> Result<(), StoreError>;

    fn get_result(&self, date: NaiveDate) -> Result<Option<ClearingResult>, StoreError>;
}

pub trait StateStore: Send + Sync {
    /// Record the state of `agent_id` at the end of `date`
    fn set_state(&self, date: NaiveDate, agent_id: &str, state: AssetState) -> Result<(), StoreError>;

    /// Most recent recorded state and the day it closed
    fn latest_state(&self, agent_id: &str) -> Result<Option<(NaiveDate, AssetState)>, StoreError>;
}

/// One timestamped row of a measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub timestamp: NaiveDateTime,
}

pub trait TimeSeriesStore: Send + Sync {
    /// Write one row per timestamp; every field series must match the
    /// timestamps in length
    fn write(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        fields: &BTreeMap<String, Vec<f64>>,
        timestamps: &[NaiveDateTime],
    ) -> Result<(), StoreError>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryStore {
    orders: RwLock<BTreeMap<(NaiveDate, String), OrderBook>>,
    results: RwLock<BTreeMap<NaiveDate, ClearingResult>>,
    states: RwLock<BTreeMap<String, BTreeMap<NaiveDate, AssetState>>>,
    points: RwLock<Vec<Point>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of `measurement`, in write order
    pub fn points(&self, measurement: &str) -> Vec<Point> {
        self.points
            .read()
            .iter()
            .filter(|p| p.measurement == measurement)
            .cloned()
            .collect()
    }

    /// Every recorded state of `agent_id` by closing day
    pub fn state_history(&self, agent_id: &str) -> BTreeMap<NaiveDate, AssetState> {
        self.states.read().get(agent_id).cloned().unwrap_or_default()
    }
}

impl OrderBookStore for InMemoryStore {
    fn set_orders(&self, date: NaiveDate, agent_id: &str, book: OrderBook) -> Result<(), StoreError> {
        self.orders.write().insert((date, agent_id.to_string()), book);
        Ok(())
    }

    fn get_orders(&self, date: NaiveDate) -> Result<OrderBook, StoreError> {
        let orders = self.orders.read();
        let mut merged = OrderBook::new();
        for ((_, _), book) in orders.range((date, String::new())..).take_while(|((d, _), _)| *d == date) {
            merged.merge(book);
        }
        Ok(merged)
    }

    fn get_agent_orders(&self, date: NaiveDate, agent_id: &str) -> Result<Option<OrderBook>, StoreError> {
        Ok(self.orders.read().get(&(date, agent_id.to_string())).cloned())
    }

    fn list_agents(&self, date: NaiveDate) -> Result<Vec<String>, StoreError> {
        Ok(self
            .orders
            .read()
            .keys()
            .filter(|(d, _)| *d == date)
            .map(|(_, agent)| agent.clone())
            .collect())
    }
}

impl ClearingStore for InMemoryStore {
    fn set_result(&self, result: ClearingResult) -> Result<(), StoreError> {
        self.results.write().insert(result.date, result);
        Ok(())
    }

    fn get_result(&self, date: NaiveDate) -> Result<Option<ClearingResult>, StoreError> {
        Ok(self.results.read().get(&date).cloned())
    }
}

impl StateStore for InMemoryStore {
    fn set_state(&self, date: NaiveDate, agent_id: &str, state: AssetState) -> Result<(), StoreError> {
        self.states
            .write()
            .entry(agent_id.to_string())
            .or_default()
            .insert(date, state);
        Ok(())
    }

    fn latest_state(&self, agent_id: &str) -> Result<Option<(NaiveDate, AssetState)>, StoreError> {
        Ok(self
            .states
            .read()
            .get(agent_id)
            .and_then(|history| history.iter().next_back())
            .map(|(date, state)| (*date, state.clone())))
    }
}

impl TimeSeriesStore for InMemoryStore {
    fn write(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        fields: &BTreeMap<String, Vec<f64>>,
        timestamps: &[NaiveDateTime],
    ) -> Result<(), StoreError> {
        for (series, values) in fields {
            if values.len() != timestamps.len() {
                return Err(StoreError::Misaligned {
                    series: series.clone(),
                    values: values.len(),
                    timestamps: timestamps.len(),
                });
            }
        }
        let mut points = self.points.write();
        for (i, &timestamp) in timestamps.iter().enumerate() {
            points.push(Point {
                measurement: measurement.to_string(),
                tags: tags.clone(),
                fields: fields.iter().map(|(k, v)| (k.clone(), v[i])).collect(),
                timestamp,
            });
        }
        Ok(())
    }
}

/// Handles to every store, cheap to clone into agent tasks
#[derive(Clone)]
pub struct Stores {
    pub orders: Arc<dyn OrderBookStore>,
    pub clearing: Arc<dyn ClearingStore>,
    pub states: Arc<dyn StateStore>,
    pub series: Arc<dyn TimeSeriesStore>,
}

impl Stores {
    /// All four seams backed by one shared [`InMemoryStore`]
    pub fn in_memory() -> (Self, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let stores = Self {
            orders: store.clone(),
            clearing: store.clone(),
            states: store.clone(),
            series: store.clone(),
        };
        (stores, store)
    }
}
