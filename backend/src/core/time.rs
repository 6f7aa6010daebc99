//! Time management for the simulation
//!
//! The market operates in whole simulated days. Each day is split into
//! [`HOURS_PER_DAY`] delivery hours. This module provides deterministic
//! day advancement and hour timestamps for time-series output.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Number of delivery hours in a day-ahead auction
pub const HOURS_PER_DAY: usize = 24;

/// Manages simulated calendar days
///
/// # Example
/// ```
/// use chrono::NaiveDate;
/// use market_simulator_core_rs::SimulationClock;
///
/// let start = NaiveDate::from_ymd_opt(2018, 1, 1).unwrap();
/// let mut clock = SimulationClock::new(start);
/// assert_eq!(clock.current_day(), 0);
///
/// clock.advance_day();
/// assert_eq!(clock.current_date(), NaiveDate::from_ymd_opt(2018, 1, 2).unwrap());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationClock {
    /// First simulated day
    start: NaiveDate,
    /// Days elapsed since `start`
    current_day: usize,
}

impl SimulationClock {
    pub fn new(start: NaiveDate) -> Self {
        Self {
            start,
            current_day: 0,
        }
    }

    /// Restore a clock at a given day offset (used by checkpoints)
    pub fn at_day(start: NaiveDate, current_day: usize) -> Self {
        Self { start, current_day }
    }

    pub fn advance_day(&mut self) {
        self.current_day += 1;
    }

    /// Days elapsed since the start date (0-indexed)
    pub fn current_day(&self) -> usize {
        self.current_day
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start
    }

    /// Calendar date of the current simulated day
    pub fn current_date(&self) -> NaiveDate {
        self.start + Duration::days(self.current_day as i64)
    }

    /// Day following the current one (lookahead horizon)
    pub fn next_date(&self) -> NaiveDate {
        self.current_date() + Duration::days(1)
    }
}

/// Timestamps for each delivery hour of `date`
///
/// # Example
/// ```
/// use chrono::NaiveDate;
/// use market_simulator_core_rs::core::time::{hour_timestamps, HOURS_PER_DAY};
///
/// let date = NaiveDate::from_ymd_opt(2018, 3, 1).unwrap();
/// let stamps = hour_timestamps(date);
/// assert_eq!(stamps.len(), HOURS_PER_DAY);
/// assert_eq!(stamps[0], date.and_hms_opt(0, 0, 0).unwrap());
/// ```
pub fn hour_timestamps(date: NaiveDate) -> Vec<NaiveDateTime> {
    let midnight = date.and_time(chrono::NaiveTime::MIN);
    (0..HOURS_PER_DAY)
        .map(|h| midnight + Duration::hours(h as i64))
        .collect()
}
