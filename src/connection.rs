use futures::{Stream, StreamExt};
use std::{io, pin::Pin, time::Duration};
use tokio::io::AsyncRead;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::FramedRead;
use tracing::{info, trace};

use crate::proto::{codec::LineCodec, ProtoError, Result};
use crate::DEFAULT_READ_TIMEOUT;

/// Where and how to open the microcontroller's port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSettings {
    pub path: String,
    pub baud_rate: u32,
    /// Upper bound for a single line read.
    pub read_timeout: Duration,
}

impl PortSettings {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(ProtoError::InvalidSettings("baud rate must be positive"));
        }
        if self.read_timeout.is_zero() {
            return Err(ProtoError::InvalidSettings("read timeout must be positive"));
        }
        Ok(())
    }
}

/// Opens connections. A failed open is final for the run asking for it.
pub trait Connector: Send + Sync {
    fn open(&self, settings: &PortSettings) -> Result<Connection>;
}

/// Opens real serial ports through `tokio-serial`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(&self, settings: &PortSettings) -> Result<Connection> {
        settings.validate()?;
        #[allow(unused_mut)]
        let mut port = tokio_serial::new(settings.path.as_str(), settings.baud_rate)
            .timeout(settings.read_timeout)
            .open_native_async()?;

        #[cfg(unix)]
        port.set_exclusive(true)?;

        info!(
            port = %settings.path,
            baud = settings.baud_rate,
            "Opened serial port"
        );
        Ok(Connection::new(port, settings))
    }
}

/// An open port, read one line at a time.
///
/// Owned by exactly one acquisition run. [`Connection::close`] consumes
/// it, so a closed connection can't be read again; dropping it on an
/// early exit releases the handle too.
pub struct Connection {
    path: String,
    read_timeout: Duration,
    lines: Pin<Box<dyn Stream<Item = std::result::Result<String, io::Error>> + Send>>,
}

impl Connection {
    pub fn new<T>(port: T, settings: &PortSettings) -> Self
    where
        T: AsyncRead + Send + 'static,
    {
        Self {
            path: settings.path.clone(),
            read_timeout: settings.read_timeout,
            lines: Box::pin(FramedRead::new(port, LineCodec::new())),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Next line, or an empty one if nothing arrived within the read timeout.
    pub async fn read_line(&mut self) -> Result<String> {
        self.read_line_within(self.read_timeout).await
    }

    /// Like [`Connection::read_line`] but waits at most `limit`
    /// (never longer than the read timeout).
    ///
    /// A partially received line survives the timeout and is
    /// completed by the next call.
    pub async fn read_line_within(&mut self, limit: Duration) -> Result<String> {
        let limit = limit.min(self.read_timeout);
        match tokio::time::timeout(limit, self.lines.next()).await {
            Err(_elapsed) => Ok(String::new()),
            Ok(Some(Ok(line))) => {
                trace!(port = %self.path, line = %line, "Received line");
                Ok(line)
            }
            Ok(Some(Err(ioerr))) => Err(ioerr.into()),
            Ok(None) => Err(ProtoError::Abort),
        }
    }

    pub fn close(self) {
        info!(port = %self.path, "Closing serial port");
    }
}
