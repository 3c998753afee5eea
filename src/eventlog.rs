use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::proto::sample::CodeSample;
use crate::proto::Result;

/// One recognized trouble code, ready to be logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeEvent {
    pub timestamp: DateTime<Local>,
    pub code: String,
    pub description: String,
}

impl CodeEvent {
    pub fn new(sample: &CodeSample, description: impl Into<String>) -> Self {
        Self::at(Local::now(), sample, description)
    }

    pub fn at(
        timestamp: DateTime<Local>,
        sample: &CodeSample,
        description: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            code: sample.code.clone(),
            description: description.into(),
        }
    }
}

impl fmt::Display for CodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.code,
            self.description
        )
    }
}

/// Append-only `timestamp,code,description` records, no header.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &CodeEvent) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        wtr.serialize(event)?;
        wtr.flush()?;
        Ok(())
    }

    /// Every event logged so far, oldest first.
    pub fn events(&self) -> Result<Vec<CodeEvent>> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(File::open(&self.path)?);
        let mut events = Vec::new();
        for event in rdr.deserialize() {
            events.push(event?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(code: &str) -> CodeSample {
        CodeSample {
            code: code.to_string(),
            raw_line: code.to_string(),
        }
    }

    #[test]
    fn test_append_keeps_previous_records() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = EventLog::new(dir.path().join("error_log.csv"));

        log.append(&CodeEvent::new(&sample("P0420"), "Catalyst, Bank 1"))
            .expect("append");
        log.append(&CodeEvent::new(&sample("U0100"), "Lost Communication"))
            .expect("append");

        let events = log.events().expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].code, "P0420");
        assert_eq!(events[0].description, "Catalyst, Bank 1");
        assert_eq!(events[1].code, "U0100");

        let text = std::fs::read_to_string(log.path()).expect("read");
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_display() {
        let ts = Local
            .with_ymd_and_hms(2024, 5, 1, 14, 3, 9)
            .single()
            .expect("valid time");
        let event = CodeEvent::at(ts, &sample("B1234"), "Airbag");
        assert_eq!(event.to_string(), "14:03:09 - B1234: Airbag");
    }
}
