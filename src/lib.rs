//!
//! This library acquires telemetry from a bike's ESP32 over a
//! line-oriented serial link.
//!
//! <br>
//!
//! # Details
//!
//! - The firmware prints one record per line: either a diagnostic
//!   trouble code (`P0420`) or a battery reading
//!   (`Measured Voltage: 12.6V | Current: 1.2A | 25.0`).
//!
//! - Reading the first trouble code
//!
//!   ```no_run
//!   use bikemon::acquisition::{Acquirer, FirstMatchPolicy};
//!   use bikemon::connection::PortSettings;
//!   use bikemon::{DEFAULT_BAUDRATE, DEFAULT_TTY};
//!   #[tokio::main]
//!   async fn main() -> bikemon::Result<()> {
//!       let acquirer = Acquirer::serial(PortSettings::new(DEFAULT_TTY, DEFAULT_BAUDRATE));
//!       match acquirer.read_code(&FirstMatchPolicy::default()).await?.matched() {
//!           Some(sample) => println!("Code: {}", sample.code),
//!           None => println!("No valid error code received."),
//!       }
//!       Ok(())
//!   }
//!   ```
//!
//! - Averaging battery readings over a window
//!
//!   ```no_run
//!   use bikemon::acquisition::{Acquirer, WindowPolicy};
//!   use bikemon::connection::PortSettings;
//!   use bikemon::proto::sample::SensorParser;
//!   use bikemon::{DEFAULT_BAUDRATE, DEFAULT_TTY};
//!   #[tokio::main]
//!   async fn main() -> bikemon::Result<()> {
//!       let acquirer = Acquirer::serial(PortSettings::new(DEFAULT_TTY, DEFAULT_BAUDRATE));
//!       let reading = acquirer
//!           .sample_average(&SensorParser::delimited(), &WindowPolicy::default())
//!           .await?;
//!       println!("{:?}", reading);
//!       Ok(())
//!   }
//!   ```
//!

use std::time::Duration;

pub mod acquisition;
pub mod aggregate;
pub mod codebook;
pub mod connection;
pub mod eventlog;
pub mod health;
pub mod proto;
pub mod scheduler;

pub use acquisition::Acquirer;
pub use proto::Result;

#[cfg(unix)]
pub const DEFAULT_TTY: &str = "/dev/ttyUSB0";
#[cfg(windows)]
pub const DEFAULT_TTY: &str = "COM10";

/// Baudrate of the ESP32 firmware.
pub const DEFAULT_BAUDRATE: u32 = 115_200;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// The ESP32 reboots when the port is opened.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(5000);
