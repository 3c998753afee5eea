use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::Path;
use tracing::debug;

use crate::proto::Result;

/// Shown for codes missing from the table.
pub const NOT_FOUND: &str = "Description not found in dataset.";

#[derive(Debug, Deserialize)]
struct CodeRecord {
    #[serde(rename = "Error Code")]
    code: String,
    #[serde(rename = "Description")]
    description: String,
}

/// Trouble code descriptions, loaded from a CSV table with the
/// columns `Error Code` and `Description`. Other columns are ignored.
#[derive(Debug, Clone, Default)]
pub struct CodeBook {
    entries: HashMap<String, String>,
}

impl CodeBook {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let book = Self::from_reader(File::open(path.as_ref())?)?;
        debug!(path = %path.as_ref().display(), codes = book.len(), "Loaded code book");
        Ok(book)
    }

    pub fn from_reader<R: io::Read>(rdr: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(rdr);
        let mut entries = HashMap::new();
        for record in reader.deserialize() {
            let record: CodeRecord = record?;
            entries.insert(record.code.to_uppercase(), record.description);
        }
        Ok(Self { entries })
    }

    pub fn lookup(&self, code: &str) -> Option<&str> {
        self.entries
            .get(&code.trim().to_uppercase())
            .map(String::as_str)
    }

    /// Description of `code`, or [`NOT_FOUND`].
    pub fn describe(&self, code: &str) -> &str {
        self.lookup(code).unwrap_or(NOT_FOUND)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
