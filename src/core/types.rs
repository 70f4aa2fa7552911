use serde::{Deserialize, Serialize};

use super::error::SimError;

pub const HORIZON_YEARS: usize = 5;
pub const DEFAULT_TRIALS: u32 = 2000;
pub const MAX_TRIALS: u32 = 200_000;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalChange {
    pub year: i32,
    /// Signed year-over-year change in percent.
    pub change: f64,
}

/// Inclusive range of change years to sample from. Either order is accepted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryWindow {
    pub start_year: i32,
    pub end_year: i32,
}

impl HistoryWindow {
    pub fn new(start_year: i32, end_year: i32) -> Self {
        Self {
            start_year,
            end_year,
        }
    }

    pub fn normalized(self) -> (i32, i32) {
        (
            self.start_year.min(self.end_year),
            self.start_year.max(self.end_year),
        )
    }

    pub fn contains(self, year: i32) -> bool {
        let (start, end) = self.normalized();
        (start..=end).contains(&year)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    pub initial_value: f64,
    /// Flat monthly surcharge recorded on top of the compounding base.
    #[serde(default)]
    pub water_fee: f64,
    #[serde(default)]
    pub fixed_addition: f64,
    /// `None` leaves the lower side of the clamp open.
    pub min_hike: Option<f64>,
    /// `None` leaves the upper side of the clamp open.
    pub max_hike: Option<f64>,
    pub history_window: HistoryWindow,
    #[serde(default = "default_trials")]
    pub trials: u32,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_trials() -> u32 {
    DEFAULT_TRIALS
}

impl SimulationConfig {
    /// Same population, start value and fee, with the hike policy stripped.
    pub fn baseline(&self) -> Self {
        Self {
            fixed_addition: 0.0,
            min_hike: None,
            max_hike: None,
            ..self.clone()
        }
    }

    pub fn initial_total(&self) -> f64 {
        self.initial_value + self.water_fee
    }

    pub fn hike_bounds(&self) -> (f64, f64) {
        (
            self.min_hike.unwrap_or(f64::NEG_INFINITY),
            self.max_hike.unwrap_or(f64::INFINITY),
        )
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if !self.initial_value.is_finite() || self.initial_value <= 0.0 {
            return Err(SimError::InvalidConfig(
                "initial value must be a finite number > 0".to_string(),
            ));
        }
        if !self.water_fee.is_finite() || self.water_fee < 0.0 {
            return Err(SimError::InvalidConfig(
                "water fee must be a finite number >= 0".to_string(),
            ));
        }
        if !self.fixed_addition.is_finite() {
            return Err(SimError::InvalidConfig(
                "fixed addition must be finite".to_string(),
            ));
        }
        for (name, bound) in [("min hike", self.min_hike), ("max hike", self.max_hike)] {
            if bound.is_some_and(|v| !v.is_finite()) {
                return Err(SimError::InvalidConfig(format!("{name} must be finite")));
            }
        }
        if let (Some(min), Some(max)) = (self.min_hike, self.max_hike) {
            if min > max {
                return Err(SimError::InvalidConfig(format!(
                    "min hike {min} exceeds max hike {max}"
                )));
            }
        }
        if self.trials == 0 || self.trials > MAX_TRIALS {
            return Err(SimError::InvalidConfig(format!(
                "trials must be between 1 and {MAX_TRIALS}, got {}",
                self.trials
            )));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearStats {
    pub median: f64,
    pub p10: f64,
    pub p90: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    /// Starting rent as configured.
    pub initial_value: f64,
    /// Year-0 point: starting rent plus the flat fee.
    pub initial_total: f64,
    /// Year 0 through year `HORIZON_YEARS`.
    pub per_year: Vec<YearStats>,
}

impl SimulationResult {
    pub fn medians(&self) -> Vec<f64> {
        self.per_year.iter().map(|y| y.median).collect()
    }

    pub fn final_year(&self) -> YearStats {
        self.per_year[self.per_year.len() - 1]
    }

    pub fn summary(&self) -> Summary {
        let start_total = self.initial_total;
        let end = self.final_year();
        Summary {
            start_total,
            final_median: end.median,
            final_p10: end.p10,
            final_p90: end.p90,
            change_percent: (end.median - start_total) / start_total * 100.0,
        }
    }
}

/// Headline numbers for the statistics display.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub start_total: f64,
    pub final_median: f64,
    pub final_p10: f64,
    pub final_p90: f64,
    pub change_percent: f64,
}

pub fn year_labels() -> Vec<String> {
    (0..=HORIZON_YEARS).map(|year| format!("Year {year}")).collect()
}
