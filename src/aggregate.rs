use serde::{Deserialize, Serialize};
use std::fmt;

use crate::proto::sample::SensorSample;

/// Samples collected by one windowed run, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionWindow<T> {
    samples: Vec<T>,
}

impl<T> AcquisitionWindow<T> {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    pub fn push(&mut self, sample: T) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[T] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<T> {
        self.samples
    }
}

impl<T> Default for AcquisitionWindow<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<T> for AcquisitionWindow<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            samples: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AveragedReading {
    pub mean_voltage: f64,
    pub mean_current: f64,
    pub mean_temperature: f64,
    /// Number of samples the means were taken over, never 0.
    pub samples: usize,
}

impl fmt::Display for AveragedReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(
                f,
                "Voltage: {:.3} V, Current: {:.3} A, Temperature: {:.1} °C ({} samples)",
                self.mean_voltage, self.mean_current, self.mean_temperature, self.samples
            )
        } else {
            write!(
                f,
                "{:.3} V, {:.3} A, {:.1} °C",
                self.mean_voltage, self.mean_current, self.mean_temperature
            )
        }
    }
}

/// Terminal result of a windowed run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Averaged(AveragedReading),
    NoData,
}

impl Reading {
    pub fn averaged(&self) -> Option<&AveragedReading> {
        match self {
            Self::Averaged(r) => Some(r),
            Self::NoData => None,
        }
    }
}

/// Per channel arithmetic mean of the window.
pub fn reduce(window: AcquisitionWindow<SensorSample>) -> Reading {
    if window.is_empty() {
        return Reading::NoData;
    }
    let count = window.len();
    let (voltage, current, temperature) =
        window
            .samples()
            .iter()
            .fold((0.0, 0.0, 0.0), |(v, c, t), s| {
                (v + s.voltage, c + s.current, t + s.temperature)
            });
    let n = count as f64;
    Reading::Averaged(AveragedReading {
        mean_voltage: voltage / n,
        mean_current: current / n,
        mean_temperature: temperature / n,
        samples: count,
    })
}
