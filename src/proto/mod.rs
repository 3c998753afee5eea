use std::io;

use thiserror::Error;

pub mod codec;
pub mod sample;

#[cfg(test)]
pub(crate) mod fake;

pub type Result<T> = std::result::Result<T, ProtoError>;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Port is owned by another acquisition run.
    #[error("Port {0} is busy")]
    Busy(String),

    #[error("Invalid port settings: {0}")]
    InvalidSettings(&'static str),

    /// Device stream ended or the run finished without a result.
    #[error("Communication aborted")]
    Abort,

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Model error: {0}")]
    Model(String),
}

impl ProtoError {
    /// True for failures that happen while acquiring the port.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Serial(_) | Self::Busy(_) | Self::InvalidSettings(_)
        )
    }
}
