//! In-memory serial port for tests.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::Sleep;

use crate::connection::{Connection, Connector, PortSettings};
use crate::proto::{ProtoError, Result};

/// Replays scripted chunks, each after its own delay.
///
/// Once drained the buffer stays silent like an idle serial line,
/// or reports end of stream if built with [`FakeBuffer::closing`].
pub struct FakeBuffer {
    chunks: VecDeque<(Duration, Vec<u8>)>,
    delay: Option<Pin<Box<Sleep>>>,
    eof_when_drained: bool,
}

impl FakeBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self::scripted(vec![(Duration::ZERO, data)])
    }

    pub fn scripted(chunks: Vec<(Duration, Vec<u8>)>) -> Self {
        Self {
            chunks: chunks.into(),
            delay: None,
            eof_when_drained: false,
        }
    }

    pub fn closing(mut self) -> Self {
        self.eof_when_drained = true;
        self
    }

    pub fn silent() -> Self {
        Self::scripted(Vec::new())
    }
}

impl AsyncRead for FakeBuffer {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some((wait, _)) = this.chunks.front() else {
            return if this.eof_when_drained {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            };
        };

        if !wait.is_zero() {
            let wait = *wait;
            let sleep = this
                .delay
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(wait)));
            if sleep.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            this.delay = None;
        }

        if let Some((wait, data)) = this.chunks.front_mut() {
            let n = data.len().min(buf.remaining());
            buf.put_slice(&data[..n]);
            data.drain(..n);
            *wait = Duration::ZERO;
            if data.is_empty() {
                this.chunks.pop_front();
            }
        }
        Poll::Ready(Ok(()))
    }
}

/// Counts opens and closes of the handed out ports.
#[derive(Default)]
pub struct PortStats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    in_use: AtomicBool,
}

struct GuardedPort {
    inner: FakeBuffer,
    stats: Arc<PortStats>,
}

impl Drop for GuardedPort {
    fn drop(&mut self) {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        self.stats.in_use.store(false, Ordering::SeqCst);
    }
}

impl AsyncRead for GuardedPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

/// Hands out one scripted buffer per open, refusing a second
/// open while the previous port is still held.
pub struct FakeConnector {
    scripts: Mutex<VecDeque<FakeBuffer>>,
    pub stats: Arc<PortStats>,
    fail_open: bool,
}

impl FakeConnector {
    pub fn new(scripts: Vec<FakeBuffer>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            stats: Arc::default(),
            fail_open: false,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            fail_open: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn opened(&self) -> usize {
        self.stats.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.stats.closed.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn open(&self, settings: &PortSettings) -> Result<Connection> {
        settings.validate()?;
        if self.fail_open {
            return Err(tokio_serial::Error::new(
                tokio_serial::ErrorKind::NoDevice,
                format!("{}: no such device", settings.path),
            )
            .into());
        }
        if self.stats.in_use.swap(true, Ordering::SeqCst) {
            return Err(ProtoError::Busy(settings.path.clone()));
        }
        let inner = self
            .scripts
            .lock()
            .map_err(|_| ProtoError::Abort)?
            .pop_front()
            .unwrap_or_else(FakeBuffer::silent);
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Connection::new(
            GuardedPort {
                inner,
                stats: self.stats.clone(),
            },
            settings,
        ))
    }
}
