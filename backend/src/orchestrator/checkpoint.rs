//! Checkpoint - Save/Load Simulation State
//!
//! A snapshot holds what the next day needs: the physical state of every
//! asset, the last cleared prices and the position of the clock. Order books
//! and clearing results of past days stay in the stores.
//!
//! # Critical Invariants
//!
//! - **Config Matching**: A snapshot can only be resumed with the config it was taken under
//! - **Clock Consistency**: `current_date` is `start_date` plus `current_day` days
//! - **Physical States**: Restored asset states are within their technical bounds

use crate::config::SimulationConfig;
use crate::core::time::{SimulationClock, HOURS_PER_DAY};
use crate::models::asset::AssetState;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config hash mismatch: snapshot {expected}, current {actual}")]
    ConfigMismatch { expected: String, actual: String },

    #[error("invalid snapshot: {reason}")]
    InvalidState { reason: String },
}

// ============================================================================
// Snapshot Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSnapshot {
    pub run_id: Uuid,
    pub start_date: NaiveDate,
    /// Days completed since `start_date`
    pub current_day: usize,
    /// Next delivery day to simulate
    pub current_date: NaiveDate,
    pub asset_states: BTreeMap<String, AssetState>,
    /// Prices of the last cleared day, empty before the first clearing
    pub last_prices: Vec<f64>,
    /// SHA256 of the canonical config JSON
    pub config_hash: String,
}

impl SimulationSnapshot {
    pub fn clock(&self) -> SimulationClock {
        SimulationClock::at_day(self.start_date, self.current_day)
    }

    pub fn to_json(&self) -> Result<String, CheckpointError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Config Hashing
// ============================================================================

/// SHA256 of `config` serialized with sorted keys
pub fn compute_config_hash<T: Serialize>(config: &T) -> Result<String, CheckpointError> {
    use serde_json::Value;

    fn canonicalize(value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<String, Value> = map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(arr) => Value::Array(arr.into_iter().map(canonicalize).collect()),
            other => other,
        }
    }

    let canonical = canonicalize(serde_json::to_value(config)?);
    let json = serde_json::to_string(&canonical)?;

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// Validation
// ============================================================================

fn invalid(reason: String) -> CheckpointError {
    CheckpointError::InvalidState { reason }
}

/// Check a snapshot against `config` before resuming from it
pub fn validate_snapshot(snapshot: &SimulationSnapshot, config: &SimulationConfig) -> Result<(), CheckpointError> {
    let actual = compute_config_hash(config)?;
    if actual != snapshot.config_hash {
        return Err(CheckpointError::ConfigMismatch {
            expected: snapshot.config_hash.clone(),
            actual,
        });
    }

    if snapshot.clock().current_date() != snapshot.current_date {
        return Err(invalid(format!(
            "day {} after {} is not {}",
            snapshot.current_day, snapshot.start_date, snapshot.current_date
        )));
    }

    if !snapshot.last_prices.is_empty() && snapshot.last_prices.len() != HOURS_PER_DAY {
        return Err(invalid(format!(
            "{} last prices, expected {}",
            snapshot.last_prices.len(),
            HOURS_PER_DAY
        )));
    }
    if snapshot.last_prices.iter().any(|p| !p.is_finite()) {
        return Err(invalid("non-finite last price".to_string()));
    }

    for (agent_id, state) in &snapshot.asset_states {
        match state {
            AssetState::Thermal(thermal) => {
                if !thermal.power.is_finite() || thermal.power < 0.0 {
                    return Err(invalid(format!("{agent_id}: power {} out of range", thermal.power)));
                }
                if thermal.on_hours > 0 && thermal.off_hours > 0 {
                    return Err(invalid(format!("{agent_id}: both on and off hours counted")));
                }
            }
            AssetState::Storage(storage) => {
                if !storage.volume.is_finite() || storage.volume < 0.0 {
                    return Err(invalid(format!("{agent_id}: volume {} out of range", storage.volume)));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::{StorageState, ThermalState};

    fn snapshot(config: &SimulationConfig) -> SimulationSnapshot {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut asset_states = BTreeMap::new();
        asset_states.insert("PWP".to_string(), AssetState::Thermal(ThermalState::running(300.0, 5)));
        asset_states.insert("STO".to_string(), AssetState::Storage(StorageState { volume: 40.0 }));
        SimulationSnapshot {
            run_id: Uuid::new_v4(),
            start_date: start,
            current_day: 2,
            current_date: NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            asset_states,
            last_prices: vec![50.0; 24],
            config_hash: compute_config_hash(config).unwrap(),
        }
    }

    #[test]
    fn test_compute_config_hash_deterministic() {
        let config = SimulationConfig::default();
        assert_eq!(
            compute_config_hash(&config).unwrap(),
            compute_config_hash(&config.clone()).unwrap()
        );
    }

    #[test]
    fn test_compute_config_hash_different_for_different_configs() {
        let config = SimulationConfig::default();
        let mut other = config.clone();
        other.market.max_price += 1.0;
        assert_ne!(
            compute_config_hash(&config).unwrap(),
            compute_config_hash(&other).unwrap()
        );
    }

    #[test]
    fn test_valid_snapshot_accepted() {
        let config = SimulationConfig::default();
        assert!(validate_snapshot(&snapshot(&config), &config).is_ok());
    }

    #[test]
    fn test_config_mismatch_rejected() {
        let config = SimulationConfig::default();
        let snap = snapshot(&config);
        let mut other = config.clone();
        other.market.penalty_price += 1.0;
        assert!(matches!(
            validate_snapshot(&snap, &other),
            Err(CheckpointError::ConfigMismatch { .. })
        ));
    }

    #[test]
    fn test_inconsistent_clock_rejected() {
        let config = SimulationConfig::default();
        let mut snap = snapshot(&config);
        snap.current_day = 5;
        assert!(matches!(
            validate_snapshot(&snap, &config),
            Err(CheckpointError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_short_price_vector_rejected() {
        let config = SimulationConfig::default();
        let mut snap = snapshot(&config);
        snap.last_prices.truncate(12);
        assert!(validate_snapshot(&snap, &config).is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = SimulationConfig::default();
        let snap = snapshot(&config);
        let restored = SimulationSnapshot::from_json(&snap.to_json().unwrap()).unwrap();
        assert_eq!(restored, snap);
    }
}
