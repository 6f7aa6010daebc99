//! Forecast inputs consumed by the optimizers
//!
//! A [`PriceForecast`] is an immutable bundle of hourly power, fuel, CO₂
//! and demand series for one or more consecutive days. The first day is the
//! delivery day; any further day is lookahead used by the prevented-start
//! analysis. Absent data is always reported as a [`ForecastError`], never
//! replaced by zeros.

use crate::core::time::HOURS_PER_DAY;
use crate::models::asset::FuelType;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ForecastError {
    #[error("No forecast available for {date}")]
    Unavailable { date: NaiveDate },

    #[error("Forecast series {series} has {actual} values, expected {expected}")]
    Length {
        series: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("No fuel price series for {0:?}")]
    MissingFuel(FuelType),

    #[error("Forecast covers {available} day(s), {requested} requested")]
    Horizon { requested: usize, available: usize },
}

/// Forecast values for a single delivery day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayForecast {
    /// Day-ahead power price (€/MWh)
    pub power: Vec<f64>,
    /// CO₂ certificate price (€/t)
    pub co2: Vec<f64>,
    /// Fuel prices (€/MWh_th)
    pub fuel: BTreeMap<FuelType, Vec<f64>>,
    /// Inflexible demand (MW)
    pub demand: Vec<f64>,
}

impl DayForecast {
    /// Day with constant power price, CO₂ price and demand, no fuels
    pub fn flat(power: f64, co2: f64, demand: f64) -> Self {
        Self {
            power: vec![power; HOURS_PER_DAY],
            co2: vec![co2; HOURS_PER_DAY],
            fuel: BTreeMap::new(),
            demand: vec![demand; HOURS_PER_DAY],
        }
    }

    /// Add a constant fuel price series
    pub fn with_fuel(mut self, fuel: FuelType, price: f64) -> Self {
        self.fuel.insert(fuel, vec![price; HOURS_PER_DAY]);
        self
    }

    pub fn with_power(mut self, power: Vec<f64>) -> Self {
        self.power = power;
        self
    }

    pub fn with_demand(mut self, demand: Vec<f64>) -> Self {
        self.demand = demand;
        self
    }

    pub fn validate(&self) -> Result<(), ForecastError> {
        let check = |series: &'static str, values: &[f64]| {
            if values.len() == HOURS_PER_DAY {
                Ok(())
            } else {
                Err(ForecastError::Length {
                    series,
                    expected: HOURS_PER_DAY,
                    actual: values.len(),
                })
            }
        };
        check("power", &self.power)?;
        check("co2", &self.co2)?;
        check("demand", &self.demand)?;
        for values in self.fuel.values() {
            check("fuel", values)?;
        }
        Ok(())
    }
}

/// Hourly price inputs of the thermal model
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyPrices {
    pub power: Vec<f64>,
    pub fuel: Vec<f64>,
    pub co2: Vec<f64>,
}

impl HourlyPrices {
    pub fn hours(&self) -> usize {
        self.power.len()
    }

    /// Same fuel and CO₂ inputs with a different power price curve
    pub fn with_power(&self, power: Vec<f64>) -> Self {
        Self {
            power,
            fuel: self.fuel.clone(),
            co2: self.co2.clone(),
        }
    }
}

/// Immutable forecast for a delivery day plus optional lookahead days
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceForecast {
    pub date: NaiveDate,
    days: Vec<DayForecast>,
}

impl PriceForecast {
    pub fn new(date: NaiveDate, days: Vec<DayForecast>) -> Result<Self, ForecastError> {
        if days.is_empty() {
            return Err(ForecastError::Unavailable { date });
        }
        for day in &days {
            day.validate()?;
        }
        Ok(Self { date, days })
    }

    /// Number of consecutive days covered (delivery day included)
    pub fn days(&self) -> usize {
        self.days.len()
    }

    pub fn has_lookahead(&self) -> bool {
        self.days.len() > 1
    }

    pub fn delivery_day(&self) -> &DayForecast {
        // `new` rejects empty forecasts
        &self.days[0]
    }

    pub fn demand(&self) -> &[f64] {
        &self.delivery_day().demand
    }

    /// Power prices over the first `days` days
    pub fn power(&self, days: usize) -> Result<Vec<f64>, ForecastError> {
        self.require(days)?;
        Ok(self.days[..days]
            .iter()
            .flat_map(|d| d.power.iter().copied())
            .collect())
    }

    /// Thermal price inputs over the first `days` days for `fuel`
    pub fn thermal_prices(&self, fuel: FuelType, days: usize) -> Result<HourlyPrices, ForecastError> {
        self.require(days)?;
        let mut fuel_series = Vec::with_capacity(days * HOURS_PER_DAY);
        for day in &self.days[..days] {
            let values = day.fuel.get(&fuel).ok_or(ForecastError::MissingFuel(fuel))?;
            fuel_series.extend_from_slice(values);
        }
        Ok(HourlyPrices {
            power: self.power(days)?,
            fuel: fuel_series,
            co2: self.days[..days]
                .iter()
                .flat_map(|d| d.co2.iter().copied())
                .collect(),
        })
    }

    fn require(&self, days: usize) -> Result<(), ForecastError> {
        if days == 0 || days > self.days.len() {
            return Err(ForecastError::Horizon {
                requested: days,
                available: self.days.len(),
            });
        }
        Ok(())
    }
}

/// Source of forecasts for a delivery date
pub trait ForecastProvider: Send + Sync {
    /// Forecast starting at `date` covering up to `horizon_days` days.
    ///
    /// Implementations may return fewer days than requested when later days
    /// are unknown, but must fail when the delivery day itself is missing.
    fn forecast(&self, date: NaiveDate, horizon_days: usize) -> Result<PriceForecast, ForecastError>;
}

/// In-memory forecast provider with optional per-date overrides
///
/// # Example
/// ```
/// use chrono::NaiveDate;
/// use market_simulator_core_rs::models::forecast::{DayForecast, ForecastProvider, StaticForecast};
///
/// let provider = StaticForecast::repeating(DayForecast::flat(50.0, 20.0, 4000.0 / 24.0));
/// let date = NaiveDate::from_ymd_opt(2018, 1, 1).unwrap();
/// let forecast = provider.forecast(date, 2).unwrap();
/// assert!(forecast.has_lookahead());
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticForecast {
    default: Option<DayForecast>,
    days: BTreeMap<NaiveDate, DayForecast>,
}

impl StaticForecast {
    /// Same day profile for every date
    pub fn repeating(day: DayForecast) -> Self {
        Self {
            default: Some(day),
            days: BTreeMap::new(),
        }
    }

    /// Only the given dates are known
    pub fn dated(days: impl IntoIterator<Item = (NaiveDate, DayForecast)>) -> Self {
        Self {
            default: None,
            days: days.into_iter().collect(),
        }
    }

    pub fn with_day(mut self, date: NaiveDate, day: DayForecast) -> Self {
        self.days.insert(date, day);
        self
    }

    fn day(&self, date: NaiveDate) -> Option<&DayForecast> {
        self.days.get(&date).or(self.default.as_ref())
    }
}

impl ForecastProvider for StaticForecast {
    fn forecast(&self, date: NaiveDate, horizon_days: usize) -> Result<PriceForecast, ForecastError> {
        let mut days = Vec::with_capacity(horizon_days);
        for offset in 0..horizon_days.max(1) {
            match self.day(date + Duration::days(offset as i64)) {
                Some(day) => days.push(day.clone()),
                None => break,
            }
        }
        PriceForecast::new(date, days)
    }
}
