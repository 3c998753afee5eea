//! Background acquisition runs.
//!
//! The presentation side never awaits serial I/O itself. It hands an
//! acquisition future to a [`Scheduler`], keeps on drawing, and applies
//! the result when the [`RunHandle`] resolves or its completion
//! callback fires. All runs spawned on one scheduler share a single
//! permit, so they own the port strictly one after another.

use futures::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::proto::{ProtoError, Result};
use crate::DEFAULT_REFRESH_INTERVAL;

#[derive(Debug, Clone)]
pub struct Scheduler {
    port: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            port: Arc::new(Semaphore::new(1)),
        }
    }

    /// Start `run` in the background. It begins once every run spawned
    /// before it has finished.
    pub fn spawn<F, T>(&self, run: F) -> RunHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let port = self.port.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = match port.acquire_owned().await {
                Ok(permit) => {
                    let result = run.await;
                    drop(permit);
                    result
                }
                Err(_closed) => Err(ProtoError::Abort),
            };
            if tx.send(result).is_err() {
                debug!("Run finished, nobody waiting for its result");
            }
        });
        RunHandle { rx }
    }

    /// No run holds the port right now.
    pub fn is_idle(&self) -> bool {
        self.port.available_permits() == 1
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once with the result of a spawned run.
///
/// Resolves to [`ProtoError::Abort`] if the run panicked.
#[must_use = "a run handle does nothing unless awaited or given a callback"]
pub struct RunHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T: Send + 'static> RunHandle<T> {
    /// Call `callback` with the result instead of awaiting the handle.
    pub fn on_complete<C>(self, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(Result<T>) + Send + 'static,
    {
        tokio::spawn(async move { callback(self.await) })
    }
}

impl<T> Future for RunHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(ProtoError::Abort)))
    }
}

/// Re-arms a run after each completion while enabled.
#[derive(Debug, Clone, Copy)]
pub struct AutoRefresh {
    pub interval: Duration,
}

impl AutoRefresh {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Start the first run now and repeat `interval` after each run
    /// completes, failed runs included, until disabled.
    pub fn spawn<F, Fut, T>(&self, scheduler: &Scheduler, mut make_run: F) -> Refreshing<T>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (switch, mut enabled) = watch::channel(true);
        let (results_tx, results) = mpsc::channel(1);
        let scheduler = scheduler.clone();
        let interval = self.interval;

        let task = tokio::spawn(async move {
            loop {
                let result = scheduler.spawn(make_run()).await;
                if let Err(e) = &result {
                    warn!(error = %e, "Refresh run failed");
                }
                if results_tx.send(result).await.is_err() {
                    break;
                }
                if !*enabled.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = disabled(&mut enabled) => break,
                }
            }
            debug!("Auto refresh stopped");
        });

        Refreshing {
            switch,
            results,
            task,
        }
    }
}

impl Default for AutoRefresh {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_INTERVAL)
    }
}

async fn disabled(enabled: &mut watch::Receiver<bool>) {
    loop {
        if !*enabled.borrow() {
            return;
        }
        if enabled.changed().await.is_err() {
            return;
        }
    }
}

/// Handle for a running auto refresh.
pub struct Refreshing<T> {
    switch: watch::Sender<bool>,
    results: mpsc::Receiver<Result<T>>,
    task: JoinHandle<()>,
}

impl<T> Refreshing<T> {
    /// Result of the next completed run, `None` once refreshing stopped
    /// and every result has been taken.
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.results.recv().await
    }

    /// Stop scheduling runs. A run in progress still completes and
    /// delivers its result.
    pub fn disable(&self) {
        self.switch.send_replace(false);
    }

    pub fn is_enabled(&self) -> bool {
        *self.switch.borrow() && !self.task.is_finished()
    }
}
