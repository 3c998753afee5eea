use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Letters a diagnostic trouble code may start with
/// (powertrain, body, chassis, network).
pub const CODE_PREFIXES: [char; 4] = ['P', 'B', 'C', 'U'];

pub const CODE_LEN: usize = 5;

/// Marker the battery firmware prints in front of every reading.
pub const DEFAULT_SENSOR_MARKER: &str = "Measured Voltage";

const FIELD_DELIMITER: char = '|';
const VALUE_SEPARATOR: char = ':';

/// Outcome of classifying a single line.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognition<T> {
    Recognized(T),
    NotRecognized,
}

impl<T> Recognition<T> {
    pub fn is_recognized(&self) -> bool {
        matches!(self, Self::Recognized(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Recognized(v) => Some(v),
            Self::NotRecognized => None,
        }
    }
}

impl<T> From<Option<T>> for Recognition<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::Recognized(v),
            None => Self::NotRecognized,
        }
    }
}

/// A strategy turning one text line into a sample.
///
/// Implementations never fail: anything they can't make sense of
/// is [`Recognition::NotRecognized`].
pub trait LineParser {
    type Sample;

    fn parse(&self, line: &str) -> Recognition<Self::Sample>;
}

/// Diagnostic trouble code, e.g. `P0420`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSample {
    pub code: String,
    pub raw_line: String,
}

impl fmt::Display for CodeSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub voltage: f64,
    pub current: f64,
    pub temperature: f64,
}

impl fmt::Display for SensorSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3} V, {:.3} A, {:.1} °C",
            self.voltage, self.current, self.temperature
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CodeParser;

impl LineParser for CodeParser {
    type Sample = CodeSample;

    fn parse(&self, line: &str) -> Recognition<CodeSample> {
        let code = line.trim().to_uppercase();
        let valid = code.chars().count() == CODE_LEN
            && code.starts_with(|c: char| CODE_PREFIXES.contains(&c));
        if valid {
            Recognition::Recognized(CodeSample {
                code,
                raw_line: line.to_string(),
            })
        } else {
            Recognition::NotRecognized
        }
    }
}

/// Layout of a battery sensor line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SensorFormat {
    /// `Measured Voltage: 12.6V | Current: 1.2A | Temperature: 25.0`
    #[default]
    Delimited,
    /// Exactly three numbers anywhere in the line.
    FreeForm,
    /// Delimited first, free-form as fallback.
    Auto,
}

impl fmt::Display for SensorFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delimited => f.write_str("delimited"),
            Self::FreeForm => f.write_str("free-form"),
            Self::Auto => f.write_str("auto"),
        }
    }
}

impl clap::ValueEnum for SensorFormat {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Delimited, Self::FreeForm, Self::Auto]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Delimited => clap::builder::PossibleValue::new("delimited"),
            Self::FreeForm => clap::builder::PossibleValue::new("free-form"),
            Self::Auto => clap::builder::PossibleValue::new("auto"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SensorParser {
    format: SensorFormat,
    marker: Option<String>,
}

impl SensorParser {
    pub fn new(format: SensorFormat, marker: Option<String>) -> Self {
        Self { format, marker }
    }

    /// Labeled fields, lines must carry [`DEFAULT_SENSOR_MARKER`].
    pub fn delimited() -> Self {
        Self::new(
            SensorFormat::Delimited,
            Some(DEFAULT_SENSOR_MARKER.to_string()),
        )
    }

    /// Three numbers anywhere, no marker required.
    pub fn free_form() -> Self {
        Self::new(SensorFormat::FreeForm, None)
    }

    pub fn with_marker(mut self, marker: Option<String>) -> Self {
        self.marker = marker.filter(|m| !m.is_empty());
        self
    }

    pub fn format(&self) -> SensorFormat {
        self.format
    }

    pub fn marker(&self) -> Option<&str> {
        self.marker.as_deref()
    }
}

impl Default for SensorParser {
    fn default() -> Self {
        Self::delimited()
    }
}

impl LineParser for SensorParser {
    type Sample = SensorSample;

    fn parse(&self, line: &str) -> Recognition<SensorSample> {
        if let Some(marker) = &self.marker {
            if !line.contains(marker.as_str()) {
                return Recognition::NotRecognized;
            }
        }
        let sample = match self.format {
            SensorFormat::Delimited => parse_delimited(line),
            SensorFormat::FreeForm => parse_free_form(line),
            SensorFormat::Auto => parse_delimited(line).or_else(|| parse_free_form(line)),
        };
        sample.into()
    }
}

/// Value part of `label: value unit`, unit letters stripped.
fn field_value(field: &str) -> Option<f64> {
    let value = match field.split_once(VALUE_SEPARATOR) {
        Some((_label, value)) => value,
        None => field,
    };
    let value = value
        .trim()
        .trim_end_matches(|c: char| c.is_alphabetic() || c == '°')
        .trim_end();
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_delimited(line: &str) -> Option<SensorSample> {
    let fields: Vec<&str> = line.trim().split(FIELD_DELIMITER).collect();
    match fields.as_slice() {
        [voltage, current, temperature] => Some(SensorSample {
            voltage: field_value(voltage)?,
            current: field_value(current)?,
            temperature: field_value(temperature)?,
        }),
        _ => None,
    }
}

fn number_pattern() -> &'static Regex {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    NUMBER.get_or_init(|| Regex::new(r"[-+]?(?:\d*\.\d+|\d+)").expect("Invalid number pattern"))
}

fn parse_free_form(line: &str) -> Option<SensorSample> {
    let numbers: Vec<f64> = number_pattern()
        .find_iter(line)
        .map(|m| m.as_str().parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect::<Option<_>>()?;
    match numbers.as_slice() {
        [voltage, current, temperature] => Some(SensorSample {
            voltage: *voltage,
            current: *current,
            temperature: *temperature,
        }),
        _ => None,
    }
}
