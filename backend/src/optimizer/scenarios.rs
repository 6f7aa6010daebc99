//! Price-shape scenarios for storage bidding
//!
//! Storage revenue depends on the shape of the price curve rather than its
//! level, so instead of price steps the storage optimizer is solved against
//! several plausible reshapings of the forecast. Each yields one complete
//! alternative trajectory offered as an exclusive block.

use crate::core::time::HOURS_PER_DAY;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// First and last hour (exclusive) of the peak block
const PEAK_HOURS: (usize, usize) = (8, 20);

/// Daylight window of the solar-shaped curve
const SOLAR_HOURS: (usize, usize) = (6, 18);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceScenario {
    /// Forecast as is
    Base,
    /// Curve moved earlier by the configured shift
    ShiftEarlier,
    /// Curve moved later by the configured shift
    ShiftLater,
    /// Mean peak price in peak hours, mean off-peak price otherwise
    PeakOffPeak,
    /// Midday dip as produced by high PV infeed
    SolarShaped,
    /// Forecast demand profile rescaled to the price range
    DemandShaped,
}

impl PriceScenario {
    pub const ALL: [PriceScenario; 6] = [
        PriceScenario::Base,
        PriceScenario::ShiftEarlier,
        PriceScenario::ShiftLater,
        PriceScenario::PeakOffPeak,
        PriceScenario::SolarShaped,
        PriceScenario::DemandShaped,
    ];

    /// Reshape `prices` (one day) according to this scenario
    ///
    /// # Example
    /// ```
    /// use market_simulator_core_rs::optimizer::PriceScenario;
    ///
    /// let prices: Vec<f64> = (0..24).map(|h| h as f64).collect();
    /// let later = PriceScenario::ShiftLater.apply(&prices, &[0.0; 24], 1);
    /// assert_eq!(later[0], 0.0);
    /// assert_eq!(later[5], 4.0);
    /// ```
    pub fn apply(self, prices: &[f64], demand: &[f64], shift: usize) -> Vec<f64> {
        let hours = prices.len();
        if hours == 0 {
            return Vec::new();
        }
        let last = hours - 1;
        let (mean, lo, hi) = stats(prices);

        match self {
            PriceScenario::Base => prices.to_vec(),
            PriceScenario::ShiftEarlier => (0..hours).map(|h| prices[(h + shift).min(last)]).collect(),
            PriceScenario::ShiftLater => (0..hours).map(|h| prices[h.saturating_sub(shift)]).collect(),
            PriceScenario::PeakOffPeak => {
                let is_peak = |h: usize| (PEAK_HOURS.0..PEAK_HOURS.1).contains(&(h % HOURS_PER_DAY));
                let peak: Vec<f64> = (0..hours).filter(|&h| is_peak(h)).map(|h| prices[h]).collect();
                let off: Vec<f64> = (0..hours).filter(|&h| !is_peak(h)).map(|h| prices[h]).collect();
                let peak_mean = stats(&peak).0;
                let off_mean = stats(&off).0;
                (0..hours)
                    .map(|h| if is_peak(h) { peak_mean } else { off_mean })
                    .collect()
            }
            PriceScenario::SolarShaped => {
                let amplitude = (hi - lo) / 2.0;
                let span = (SOLAR_HOURS.1 - SOLAR_HOURS.0) as f64;
                (0..hours)
                    .map(|h| {
                        let hour = h % HOURS_PER_DAY;
                        if (SOLAR_HOURS.0..=SOLAR_HOURS.1).contains(&hour) {
                            let phase = PI * (hour - SOLAR_HOURS.0) as f64 / span;
                            mean - amplitude * phase.sin()
                        } else {
                            mean
                        }
                    })
                    .collect()
            }
            PriceScenario::DemandShaped => {
                if demand.len() != hours {
                    return prices.to_vec();
                }
                let (d_mean, d_lo, d_hi) = stats(demand);
                if d_hi - d_lo <= f64::EPSILON {
                    return vec![mean; hours];
                }
                let scale = (hi - lo) / (d_hi - d_lo);
                demand.iter().map(|d| mean + (d - d_mean) * scale).collect()
            }
        }
    }
}

/// (mean, min, max), zeros for an empty slice
fn stats(values: &[f64]) -> (f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (mean, lo, hi)
}
