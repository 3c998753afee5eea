//! Acquisition loops.
//!
//! Both modes share the same primitives: open a [`Connection`], read
//! lines, classify them with a [`LineParser`] and close the connection
//! before handing back a result. They differ in when they stop:
//!
//! * first-match ([`Acquirer::first_match`]) stops at the first
//!   recognized line or when its overall deadline passes,
//! * windowed ([`Acquirer::read_window`]) keeps every recognized line
//!   until a fixed duration, measured from the start of the run, has
//!   elapsed.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::aggregate::{reduce, AcquisitionWindow, Reading};
use crate::connection::{Connection, Connector, PortSettings, SerialConnector};
use crate::proto::sample::{CodeParser, CodeSample, LineParser, Recognition, SensorParser};
use crate::proto::Result;
use crate::{DEFAULT_MAX_RETRIES, DEFAULT_SETTLE_DELAY, DEFAULT_WINDOW};

/// Time source for deadlines.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Tokio's clock, which follows paused time in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstMatchPolicy {
    /// Pause after opening, the ESP32 resets when the port opens.
    pub settle_delay: Duration,
    /// Line reads allowed after settling.
    pub max_retries: u32,
}

impl FirstMatchPolicy {
    /// Overall bound for a run, measured from the open call.
    pub fn max_wait(&self, read_timeout: Duration) -> Duration {
        self.settle_delay + read_timeout.saturating_mul(self.max_retries.max(1))
    }
}

impl Default for FirstMatchPolicy {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub duration: Duration,
    /// Counted against `duration`.
    pub settle_delay: Duration,
}

impl WindowPolicy {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            settle_delay: Duration::ZERO,
        }
    }
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Terminal state of a first-match run that got its port.
#[derive(Debug, Clone, PartialEq)]
pub enum FirstMatch<T> {
    Matched(T),
    TimedOut,
}

impl<T> FirstMatch<T> {
    pub fn matched(self) -> Option<T> {
        match self {
            Self::Matched(v) => Some(v),
            Self::TimedOut => None,
        }
    }
}

pub type CodeOutcome = FirstMatch<CodeSample>;

/// Runs acquisitions against one port.
///
/// Cheap to clone; every run opens its own connection and closes it
/// before returning, on success, timeout and error alike.
#[derive(Clone)]
pub struct Acquirer {
    connector: Arc<dyn Connector>,
    settings: PortSettings,
    clock: Arc<dyn Clock>,
}

impl Acquirer {
    pub fn new(connector: impl Connector + 'static, settings: PortSettings) -> Self {
        Self::shared(Arc::new(connector), settings)
    }

    /// Acquire through a connector the caller keeps a handle to.
    pub fn shared(connector: Arc<dyn Connector>, settings: PortSettings) -> Self {
        Self {
            connector,
            settings,
            clock: Arc::new(TokioClock),
        }
    }

    pub fn serial(settings: PortSettings) -> Self {
        Self::new(SerialConnector, settings)
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn settings(&self) -> &PortSettings {
        &self.settings
    }

    /// Wait for the first line `parser` recognizes.
    pub async fn first_match<P>(
        &self,
        parser: &P,
        policy: &FirstMatchPolicy,
    ) -> Result<FirstMatch<P::Sample>>
    where
        P: LineParser + Sync,
        P::Sample: Send,
    {
        let start = self.clock.now();
        let mut conn = self.connector.open(&self.settings)?;
        let outcome = self.listen(&mut conn, parser, policy, start).await;
        conn.close();
        match &outcome {
            Ok(FirstMatch::Matched(_)) => info!(port = %self.settings.path, "Recognized line"),
            Ok(FirstMatch::TimedOut) => info!(port = %self.settings.path, "No line recognized"),
            Err(e) => info!(port = %self.settings.path, error = %e, "Acquisition failed"),
        }
        outcome
    }

    async fn listen<P>(
        &self,
        conn: &mut Connection,
        parser: &P,
        policy: &FirstMatchPolicy,
        start: Instant,
    ) -> Result<FirstMatch<P::Sample>>
    where
        P: LineParser + Sync,
        P::Sample: Send,
    {
        if !policy.settle_delay.is_zero() {
            tokio::time::sleep(policy.settle_delay).await;
        }
        let deadline = start + policy.max_wait(conn.read_timeout());

        loop {
            let now = self.clock.now();
            if now >= deadline {
                return Ok(FirstMatch::TimedOut);
            }
            let line = conn.read_line_within(deadline - now).await?;
            if line.trim().is_empty() {
                continue;
            }
            match parser.parse(&line) {
                Recognition::Recognized(sample) => return Ok(FirstMatch::Matched(sample)),
                Recognition::NotRecognized => trace!(line = %line, "Skipped line"),
            }
        }
    }

    /// First diagnostic trouble code seen on the port.
    pub async fn read_code(&self, policy: &FirstMatchPolicy) -> Result<CodeOutcome> {
        self.first_match(&CodeParser, policy).await
    }

    /// Collect every line `parser` recognizes until the window closes.
    pub async fn read_window<P>(
        &self,
        parser: &P,
        policy: &WindowPolicy,
    ) -> Result<AcquisitionWindow<P::Sample>>
    where
        P: LineParser + Sync,
        P::Sample: Send + std::fmt::Debug,
    {
        let start = self.clock.now();
        let mut conn = self.connector.open(&self.settings)?;
        let window = self.collect(&mut conn, parser, policy, start).await;
        conn.close();
        if let Ok(window) = &window {
            info!(
                port = %self.settings.path,
                samples = window.len(),
                "Acquisition window closed"
            );
        }
        window
    }

    async fn collect<P>(
        &self,
        conn: &mut Connection,
        parser: &P,
        policy: &WindowPolicy,
        start: Instant,
    ) -> Result<AcquisitionWindow<P::Sample>>
    where
        P: LineParser + Sync,
        P::Sample: Send + std::fmt::Debug,
    {
        let deadline = start + policy.duration;
        if !policy.settle_delay.is_zero() {
            tokio::time::sleep_until(deadline.min(start + policy.settle_delay)).await;
        }

        let mut window = AcquisitionWindow::new();
        loop {
            let now = self.clock.now();
            if now >= deadline {
                return Ok(window);
            }
            let line = conn.read_line_within(deadline - now).await?;
            match parser.parse(&line) {
                Recognition::Recognized(sample) => {
                    debug!(?sample, "Sample");
                    window.push(sample);
                }
                Recognition::NotRecognized if line.is_empty() => {}
                Recognition::NotRecognized => trace!(line = %line, "Skipped line"),
            }
        }
    }

    /// Windowed run reduced to per channel means.
    pub async fn sample_average(
        &self,
        parser: &SensorParser,
        policy: &WindowPolicy,
    ) -> Result<Reading> {
        let window = self.read_window(parser, policy).await?;
        Ok(reduce(window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::fake::{FakeBuffer, FakeConnector};
    use crate::proto::ProtoError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const READ_TIMEOUT: Duration = Duration::from_secs(2);

    fn settings() -> PortSettings {
        PortSettings::new("/dev/ttyFAKE", 115_200).with_read_timeout(READ_TIMEOUT)
    }

    fn acquirer(connector: Arc<FakeConnector>) -> Acquirer {
        Acquirer {
            connector,
            settings: settings(),
            clock: Arc::new(TokioClock),
        }
    }

    fn lines(text: &str) -> FakeBuffer {
        FakeBuffer::new(text.as_bytes().to_vec())
    }

    /// Advances by `step` on every reading.
    struct SteppingClock {
        base: Instant,
        step: Duration,
        calls: AtomicU32,
    }

    impl Clock for SteppingClock {
        fn now(&self) -> Instant {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.base + self.step * n
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_code_wins() {
        let connector = Arc::new(FakeConnector::new(vec![lines(
            "ets Jun  8 2016 00:22:57\r\n\r\nhello\r\np0420\r\nU0100\r\n",
        )]));
        let outcome = acquirer(connector.clone())
            .read_code(&FirstMatchPolicy::default())
            .await
            .expect("run");
        let sample = outcome.matched().expect("matched");
        assert_eq!(sample.code, "P0420");
        assert_eq!(connector.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_port_times_out() {
        let connector = Arc::new(FakeConnector::new(vec![FakeBuffer::silent()]));
        let policy = FirstMatchPolicy {
            settle_delay: Duration::from_secs(2),
            max_retries: 3,
        };
        let start = Instant::now();
        let outcome = acquirer(connector.clone())
            .read_code(&policy)
            .await
            .expect("run");
        assert_eq!(outcome, FirstMatch::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= policy.max_wait(READ_TIMEOUT));
        assert!(elapsed < policy.max_wait(READ_TIMEOUT) + READ_TIMEOUT);
        assert_eq!(connector.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_noise_does_not_extend_deadline() {
        let noise: Vec<_> = (0..1000)
            .map(|i| (Duration::from_millis(100), format!("noise {}\n", i).into_bytes()))
            .collect();
        let connector = Arc::new(FakeConnector::new(vec![FakeBuffer::scripted(noise)]));
        let policy = FirstMatchPolicy {
            settle_delay: Duration::ZERO,
            max_retries: 2,
        };
        let start = Instant::now();
        let outcome = acquirer(connector)
            .read_code(&policy)
            .await
            .expect("run");
        assert_eq!(outcome, FirstMatch::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_code_after_a_quiet_read() {
        let connector = Arc::new(FakeConnector::new(vec![FakeBuffer::scripted(vec![(
            Duration::from_secs(5),
            b"B1234\r\n".to_vec(),
        )])]));
        let policy = FirstMatchPolicy {
            settle_delay: Duration::from_secs(2),
            max_retries: 3,
        };
        let outcome = acquirer(connector)
            .read_code(&policy)
            .await
            .expect("run");
        assert_eq!(outcome.matched().map(|s| s.code), Some("B1234".to_string()));
    }

    #[tokio::test]
    async fn test_unavailable_port_fails() {
        let connector = Arc::new(FakeConnector::unavailable());
        let err = acquirer(connector.clone())
            .read_code(&FirstMatchPolicy::default())
            .await
            .err()
            .expect("open must fail");
        assert!(err.is_connection_error());
        assert_eq!(connector.opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_device_closes_port() {
        let connector = Arc::new(FakeConnector::new(vec![lines("boot\n").closing()]));
        let result = acquirer(connector.clone())
            .read_code(&FirstMatchPolicy::default())
            .await;
        assert!(matches!(result, Err(ProtoError::Abort)));
        assert_eq!(connector.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_reopens_after_each_run() {
        let connector = Arc::new(FakeConnector::new(vec![
            lines("P0420\n"),
            FakeBuffer::silent(),
            lines("C0035\n"),
        ]));
        let acq = acquirer(connector.clone());
        let policy = FirstMatchPolicy::default();
        assert!(acq.read_code(&policy).await.expect("run").matched().is_some());
        assert_eq!(
            acq.read_code(&policy).await.expect("run"),
            FirstMatch::TimedOut
        );
        assert!(acq.read_code(&policy).await.expect("run").matched().is_some());
        assert_eq!(connector.opened(), 3);
        assert_eq!(connector.closed(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_averages_samples() {
        let connector = Arc::new(FakeConnector::new(vec![lines(
            "boot\r\n\
             Measured Voltage: 12.0V | Current: 1.0A | 20.0\r\n\
             Measured Voltage: garbled | Current\r\n\
             Measured Voltage: 12.4V | Current: 1.2A | 22.0\r\n",
        )]));
        let reading = acquirer(connector.clone())
            .sample_average(
                &SensorParser::delimited(),
                &WindowPolicy::new(Duration::from_secs(60)),
            )
            .await
            .expect("run");
        let avg = reading.averaged().expect("averaged");
        assert!((avg.mean_voltage - 12.2).abs() < 1e-9);
        assert!((avg.mean_current - 1.1).abs() < 1e-9);
        assert!((avg.mean_temperature - 21.0).abs() < 1e-9);
        assert_eq!(avg.samples, 2);
        assert_eq!(connector.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_without_samples_has_no_data() {
        let connector = Arc::new(FakeConnector::new(vec![lines("hello\nP0420\n")]));
        let duration = Duration::from_secs(10);
        let start = Instant::now();
        let reading = acquirer(connector)
            .sample_average(&SensorParser::delimited(), &WindowPolicy::new(duration))
            .await
            .expect("run");
        assert_eq!(reading, Reading::NoData);
        assert!(start.elapsed() >= duration);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_never_ends_early() {
        let burst = "12.0 1.0 20.0\n".repeat(50);
        let connector = Arc::new(FakeConnector::new(vec![lines(&burst)]));
        let duration = Duration::from_secs(7);
        let start = Instant::now();
        let window = acquirer(connector)
            .read_window(&SensorParser::free_form(), &WindowPolicy::new(duration))
            .await
            .expect("run");
        assert_eq!(window.len(), 50);
        assert!(start.elapsed() >= duration);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_drops_late_samples() {
        let connector = Arc::new(FakeConnector::new(vec![FakeBuffer::scripted(vec![
            (Duration::from_secs(1), b"12.0 1.0 20.0\n".to_vec()),
            (Duration::from_secs(3), b"12.2 1.1 21.0\n".to_vec()),
            (Duration::from_secs(10), b"99.0 9.0 99.0\n".to_vec()),
        ])]));
        let window = acquirer(connector)
            .read_window(
                &SensorParser::free_form(),
                &WindowPolicy::new(Duration::from_secs(5)),
            )
            .await
            .expect("run");
        assert_eq!(window.len(), 2);
        assert_eq!(window.samples()[1].voltage, 12.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_follows_injected_clock() {
        let burst = "12.0 1.0 20.0\n".repeat(10);
        let connector = Arc::new(FakeConnector::new(vec![lines(&burst)]));
        let acq = acquirer(connector).with_clock(SteppingClock {
            base: Instant::now(),
            step: Duration::from_secs(1),
            calls: AtomicU32::new(0),
        });
        let window = acq
            .read_window(
                &SensorParser::free_form(),
                &WindowPolicy::new(Duration::from_secs(5)),
            )
            .await
            .expect("run");
        // one clock reading at start, one per loop iteration
        assert_eq!(window.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_settle_counts_against_duration() {
        let connector = Arc::new(FakeConnector::new(vec![lines("12.0 1.0 20.0\n")]));
        let policy = WindowPolicy {
            duration: Duration::from_secs(3),
            settle_delay: Duration::from_secs(2),
        };
        let start = Instant::now();
        let window = acquirer(connector)
            .read_window(&SensorParser::free_form(), &policy)
            .await
            .expect("run");
        assert_eq!(window.len(), 1);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
