//! Asset model
//!
//! Represents a physical asset offered into the day-ahead auction.
//! Each asset has:
//! - Static technical parameters (limits, efficiencies, timing constraints)
//! - Mutable physical state carried from one simulated day to the next
//!
//! Two kinds exist: thermal power plants (unit commitment) and storage
//! (pumped hydro or batteries).
//!
//! CRITICAL: Power in MW, volume in MWh, prices in €/MWh. One dispatch
//! interval is one hour, so MW and MWh per hour are interchangeable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when an asset is constructed with inconsistent data
#[derive(Debug, Error, PartialEq)]
pub enum AssetError {
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Invalid state for {asset_id}: {reason}")]
    InvalidState { asset_id: String, reason: String },
}

/// Fuel consumed by a thermal plant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuelType {
    Lignite,
    Coal,
    Gas,
    Oil,
    Nuclear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Thermal,
    Storage,
}

// ============================================================================
// Thermal
// ============================================================================

/// Static parameters of a thermal unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalParams {
    /// Maximum electrical output (MW)
    pub max_power: f64,
    /// Minimum stable output while running (MW)
    pub min_power: f64,
    /// Electrical efficiency (0, 1]
    pub efficiency: f64,
    /// CO₂ emitted per MWh of fuel (t/MWh_th)
    pub emission_factor: f64,
    /// Maximum output increase per hour (MW/h)
    pub ramp_up: f64,
    /// Maximum output decrease per hour (MW/h)
    pub ramp_down: f64,
    /// Minimum consecutive hours on after a start
    pub min_run_time: usize,
    /// Minimum consecutive hours off after a stop
    pub min_stop_time: usize,
    /// Fixed cost per start (€)
    pub start_cost: f64,
    pub fuel: FuelType,
}

impl ThermalParams {
    /// Check physical consistency of the parameters
    pub fn validate(&self) -> Result<(), AssetError> {
        let positive = |name: &'static str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(AssetError::InvalidParameter {
                    name,
                    reason: format!("must be positive and finite, got {}", value),
                })
            }
        };

        positive("max_power", self.max_power)?;
        positive("efficiency", self.efficiency)?;
        positive("ramp_up", self.ramp_up)?;
        positive("ramp_down", self.ramp_down)?;

        if !(self.min_power.is_finite() && self.min_power > 0.0 && self.min_power <= self.max_power) {
            return Err(AssetError::InvalidParameter {
                name: "min_power",
                reason: format!(
                    "must lie in (0, max_power={}], got {}",
                    self.max_power, self.min_power
                ),
            });
        }
        if self.efficiency > 1.0 {
            return Err(AssetError::InvalidParameter {
                name: "efficiency",
                reason: format!("must not exceed 1, got {}", self.efficiency),
            });
        }
        if !(self.emission_factor.is_finite() && self.emission_factor >= 0.0) {
            return Err(AssetError::InvalidParameter {
                name: "emission_factor",
                reason: format!("must be non-negative, got {}", self.emission_factor),
            });
        }
        if !(self.start_cost.is_finite() && self.start_cost >= 0.0) {
            return Err(AssetError::InvalidParameter {
                name: "start_cost",
                reason: format!("must be non-negative, got {}", self.start_cost),
            });
        }
        Ok(())
    }

    /// Fuel and emission cost of one MWh of electrical output
    pub fn marginal_cost(&self, fuel_price: f64, co2_price: f64) -> f64 {
        (fuel_price + self.emission_factor * co2_price) / self.efficiency
    }
}

/// Mutable physical state of a thermal unit at the end of a day
///
/// Exactly one of `on_hours` / `off_hours` is non-zero for a settled unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalState {
    /// Output in the last dispatched hour (MW)
    pub power: f64,
    /// Consecutive hours the unit has been running
    pub on_hours: usize,
    /// Consecutive hours the unit has been off
    pub off_hours: usize,
}

impl ThermalState {
    /// Unit that has been off long enough to start freely
    pub fn cold() -> Self {
        Self {
            power: 0.0,
            on_hours: 0,
            off_hours: usize::MAX,
        }
    }

    /// Unit running at `power` for `on_hours` hours
    pub fn running(power: f64, on_hours: usize) -> Self {
        Self {
            power,
            on_hours,
            off_hours: 0,
        }
    }

    pub fn is_on(&self) -> bool {
        self.on_hours > 0
    }

    /// Advance the counters over a realized schedule
    pub fn advance(&self, schedule: &[f64], tolerance: f64) -> Self {
        let mut next = self.clone();
        for &p in schedule {
            if p > tolerance {
                next.on_hours = next.on_hours.saturating_add(1);
                next.off_hours = 0;
                next.power = p;
            } else {
                next.off_hours = next.off_hours.saturating_add(1);
                next.on_hours = 0;
                next.power = 0.0;
            }
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalAsset {
    pub id: String,
    pub params: ThermalParams,
    pub state: ThermalState,
}

impl ThermalAsset {
    /// Create a thermal asset after validating its parameters
    ///
    /// # Example
    /// ```
    /// use market_simulator_core_rs::models::asset::{FuelType, ThermalAsset, ThermalParams, ThermalState};
    ///
    /// let params = ThermalParams {
    ///     max_power: 300.0,
    ///     min_power: 100.0,
    ///     efficiency: 0.4,
    ///     emission_factor: 0.0,
    ///     ramp_up: 300.0,
    ///     ramp_down: 300.0,
    ///     min_run_time: 1,
    ///     min_stop_time: 1,
    ///     start_cost: 0.0,
    ///     fuel: FuelType::Gas,
    /// };
    /// let asset = ThermalAsset::new("PWP_1", params, ThermalState::cold()).unwrap();
    /// assert!(!asset.state.is_on());
    /// ```
    pub fn new(
        id: impl Into<String>,
        params: ThermalParams,
        state: ThermalState,
    ) -> Result<Self, AssetError> {
        params.validate()?;
        Ok(Self {
            id: id.into(),
            params,
            state,
        })
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Static parameters of a storage unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageParams {
    /// Usable energy capacity, upper volume bound (MWh)
    pub capacity: f64,
    /// Lower volume bound (MWh)
    pub min_volume: f64,
    /// Maximum grid consumption while charging (MW)
    pub charge_power: f64,
    /// Maximum grid injection while discharging (MW)
    pub discharge_power: f64,
    /// Share of consumed energy that ends up stored
    pub charge_efficiency: f64,
    /// Share of stored energy that reaches the grid
    pub discharge_efficiency: f64,
}

impl StorageParams {
    pub fn validate(&self) -> Result<(), AssetError> {
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(AssetError::InvalidParameter {
                name: "capacity",
                reason: format!("must be positive, got {}", self.capacity),
            });
        }
        if !(self.min_volume >= 0.0 && self.min_volume < self.capacity) {
            return Err(AssetError::InvalidParameter {
                name: "min_volume",
                reason: format!(
                    "must lie in [0, capacity={}), got {}",
                    self.capacity, self.min_volume
                ),
            });
        }
        for (name, value) in [
            ("charge_power", self.charge_power),
            ("discharge_power", self.discharge_power),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(AssetError::InvalidParameter {
                    name,
                    reason: format!("must be positive, got {}", value),
                });
            }
        }
        for (name, value) in [
            ("charge_efficiency", self.charge_efficiency),
            ("discharge_efficiency", self.discharge_efficiency),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(AssetError::InvalidParameter {
                    name,
                    reason: format!("must lie in (0, 1], got {}", value),
                });
            }
        }
        Ok(())
    }

    pub fn round_trip_efficiency(&self) -> f64 {
        self.charge_efficiency * self.discharge_efficiency
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    /// Stored energy at the end of the last dispatched hour (MWh)
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageAsset {
    pub id: String,
    pub params: StorageParams,
    pub state: StorageState,
}

impl StorageAsset {
    pub fn new(
        id: impl Into<String>,
        params: StorageParams,
        state: StorageState,
    ) -> Result<Self, AssetError> {
        params.validate()?;
        let id = id.into();
        if state.volume < params.min_volume || state.volume > params.capacity {
            return Err(AssetError::InvalidState {
                asset_id: id,
                reason: format!(
                    "volume {} outside [{}, {}]",
                    state.volume, params.min_volume, params.capacity
                ),
            });
        }
        Ok(Self { id, params, state })
    }
}

// ============================================================================
// Shared
// ============================================================================

/// Physical state of either asset kind, as persisted between days
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetState {
    Thermal(ThermalState),
    Storage(StorageState),
}

impl AssetState {
    pub fn kind(&self) -> AssetKind {
        match self {
            AssetState::Thermal(_) => AssetKind::Thermal,
            AssetState::Storage(_) => AssetKind::Storage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Asset {
    Thermal(ThermalAsset),
    Storage(StorageAsset),
}

impl Asset {
    pub fn id(&self) -> &str {
        match self {
            Asset::Thermal(a) => &a.id,
            Asset::Storage(a) => &a.id,
        }
    }

    pub fn kind(&self) -> AssetKind {
        match self {
            Asset::Thermal(_) => AssetKind::Thermal,
            Asset::Storage(_) => AssetKind::Storage,
        }
    }

    pub fn state(&self) -> AssetState {
        match self {
            Asset::Thermal(a) => AssetState::Thermal(a.state.clone()),
            Asset::Storage(a) => AssetState::Storage(a.state.clone()),
        }
    }

    /// Replace the mutable state; fails when the kinds differ
    pub fn set_state(&mut self, state: AssetState) -> Result<(), AssetError> {
        match (self, state) {
            (Asset::Thermal(a), AssetState::Thermal(s)) => {
                a.state = s;
                Ok(())
            }
            (Asset::Storage(a), AssetState::Storage(s)) => {
                a.state = s;
                Ok(())
            }
            (asset, state) => Err(AssetError::InvalidState {
                asset_id: asset.id().to_string(),
                reason: format!("cannot apply {:?} state to {:?} asset", state.kind(), asset.kind()),
            }),
        }
    }
}
