//! Battery health estimate from averaged readings.
//!
//! The estimator is a pre-trained regression. It only sees the features
//! it was trained on, by name; inputs it doesn't name are ignored and
//! names it knows but this crate doesn't provide count as 0.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::aggregate::AveragedReading;
use crate::proto::{ProtoError, Result};

pub const FEATURE_MEASURED_VOLTAGE: &str = "Measured_Voltage";
pub const FEATURE_CURRENT: &str = "Current";
pub const FEATURE_TEMPERATURE: &str = "Temperature";
pub const FEATURE_VOLTAGE_DROP: &str = "Voltage_Drop";
pub const FEATURE_DAYS_USED: &str = "Days_Used";

/// Column names used by models trained on the recorded battery dataset.
const FEATURE_ALIASES: &[(&str, &str)] = &[
    ("Measured Voltage (V)", FEATURE_MEASURED_VOLTAGE),
    ("Measured Current (A)", FEATURE_CURRENT),
    ("Temperature (C)", FEATURE_TEMPERATURE),
    ("Voltage Drop", FEATURE_VOLTAGE_DROP),
    ("Days Used", FEATURE_DAYS_USED),
];

pub const PURCHASE_DATE_FORMAT: &str = "%Y-%m-%d";

pub fn parse_purchase_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), PURCHASE_DATE_FORMAT)
        .map_err(|e| ProtoError::Model(format!("Invalid purchase date {:?}: {}", s, e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelInput {
    pub measured_voltage: f64,
    pub current: f64,
    pub temperature: f64,
    /// Initial voltage minus measured voltage.
    pub voltage_drop: f64,
    pub days_used: i64,
}

impl ModelInput {
    pub fn new(
        reading: &AveragedReading,
        initial_voltage: f64,
        purchase_date: NaiveDate,
        today: NaiveDate,
    ) -> Result<Self> {
        if !initial_voltage.is_finite() || initial_voltage <= 0.0 {
            return Err(ProtoError::Model(format!(
                "Initial voltage must be positive, got {}",
                initial_voltage
            )));
        }
        let days_used = (today - purchase_date).num_days();
        if days_used < 0 {
            return Err(ProtoError::Model(format!(
                "Purchase date {} is in the future",
                purchase_date
            )));
        }
        Ok(Self {
            measured_voltage: reading.mean_voltage,
            current: reading.mean_current,
            temperature: reading.mean_temperature,
            voltage_drop: initial_voltage - reading.mean_voltage,
            days_used,
        })
    }

    pub fn feature(&self, name: &str) -> f64 {
        let name = FEATURE_ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .map_or(name, |(_, canonical)| *canonical);
        match name {
            FEATURE_MEASURED_VOLTAGE => self.measured_voltage,
            FEATURE_CURRENT => self.current,
            FEATURE_TEMPERATURE => self.temperature,
            FEATURE_VOLTAGE_DROP => self.voltage_drop,
            FEATURE_DAYS_USED => self.days_used as f64,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthEstimate {
    pub health_percent: f64,
    pub cycle_count: f64,
    pub remaining_life_days: f64,
}

impl fmt::Display for HealthEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Health: {:.2}%", self.health_percent)?;
        writeln!(f, "Cycle Count: {}", self.cycle_count as i64)?;
        write!(f, "Remaining Life: {} days", self.remaining_life_days as i64)
    }
}

pub trait HealthModel {
    fn predict(&self, input: &ModelInput) -> Result<HealthEstimate>;
}

/// Multi-output linear regression exported as JSON:
///
/// ```json
/// {
///   "features": ["Voltage_Drop", "Current", "Temperature"],
///   "intercept": [98.0, 10.0, 900.0],
///   "coefficients": [[-20.0, -1.5, -0.1], [150.0, 4.0, 1.0], [-300.0, -10.0, -2.0]]
/// }
/// ```
///
/// Rows of `coefficients` are health, cycle count and remaining life.
/// An optional `"scaler": {"mean": [..], "scale": [..]}` standardizes each
/// feature as `(x - mean) / scale` before the coefficients apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub features: Vec<String>,
    pub intercept: [f64; 3],
    pub coefficients: [Vec<f64>; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaler: Option<StandardScaler>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    fn transform(&self, index: usize, value: f64) -> f64 {
        (value - self.mean[index]) / self.scale[index]
    }
}

impl LinearModel {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let model: Self = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        if let Some(row) = self
            .coefficients
            .iter()
            .find(|row| row.len() != self.features.len())
        {
            return Err(ProtoError::Model(format!(
                "Expected {} coefficients per output, found {}",
                self.features.len(),
                row.len()
            )));
        }
        if let Some(scaler) = &self.scaler {
            let n = self.features.len();
            if scaler.mean.len() != n || scaler.scale.len() != n {
                return Err(ProtoError::Model(format!(
                    "Expected {} scaler values, found {} means and {} scales",
                    n,
                    scaler.mean.len(),
                    scaler.scale.len()
                )));
            }
            if scaler.scale.iter().any(|s| *s == 0.0 || !s.is_finite()) {
                return Err(ProtoError::Model("Scaler scale must be non-zero".to_string()));
            }
        }
        Ok(())
    }

    fn output(&self, index: usize, input: &ModelInput) -> f64 {
        self.features
            .iter()
            .zip(&self.coefficients[index])
            .enumerate()
            .fold(self.intercept[index], |acc, (i, (name, coef))| {
                let value = input.feature(name);
                let value = match &self.scaler {
                    Some(scaler) => scaler.transform(i, value),
                    None => value,
                };
                acc + coef * value
            })
    }
}

impl HealthModel for LinearModel {
    fn predict(&self, input: &ModelInput) -> Result<HealthEstimate> {
        self.validate()?;
        Ok(HealthEstimate {
            health_percent: self.output(0, input),
            cycle_count: self.output(1, input),
            remaining_life_days: self.output(2, input),
        })
    }
}
