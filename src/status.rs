//! Status reporting towards the controller.
//!
//! Pushes are fire-and-forget: the worker hands a status to a channel and a
//! background task delivers it, logging failures without retrying.

use crate::controller::{Controller, WorkerStatus};
use crate::{log_debug, log_info, log_warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Receives human-readable progress from the copy engines.
pub trait ProgressSink: Send {
    fn report(&mut self, message: String, important: bool);
}

/// Discards everything.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&mut self, _message: String, _important: bool) {}
}

/// Rate limit for progress messages. Important messages always pass and do
/// not move the window.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn permit(&mut self, now: Instant, important: bool) -> bool {
        if important {
            return true;
        }
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

pub struct StatusReporter {
    tx: mpsc::UnboundedSender<WorkerStatus>,
    throttle: Throttle,
    pusher: Option<JoinHandle<()>>,
}

impl StatusReporter {
    /// Reporter plus the receiving end, for callers that deliver statuses
    /// themselves.
    pub fn channel(interval: Duration) -> (Self, mpsc::UnboundedReceiver<WorkerStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                throttle: Throttle::new(interval),
                pusher: None,
            },
            rx,
        )
    }

    /// Reporter backed by a task pushing to `controller`.
    pub fn spawn(controller: Arc<dyn Controller>, interval: Duration) -> Self {
        let (mut reporter, rx) = Self::channel(interval);
        reporter.pusher = Some(tokio::spawn(run_pusher(controller, rx)));
        reporter
    }

    /// Queue a status, bypassing the throttle.
    pub fn push(&self, status: WorkerStatus) {
        log_info!("Status {:?}: {}", status.phase, status.message);
        if self.tx.send(status).is_err() {
            log_warn!("Status channel closed, dropping status");
        }
    }

    pub fn progress_at(&mut self, now: Instant, message: String, important: bool) -> bool {
        if !self.throttle.permit(now, important) {
            log_debug!("Throttled status: {}", message);
            return false;
        }
        self.push(WorkerStatus::running(message, important));
        true
    }

    /// Close the channel and wait for queued statuses to be delivered.
    pub async fn drain(self) {
        let Self { tx, pusher, .. } = self;
        drop(tx);
        if let Some(pusher) = pusher {
            if let Err(e) = pusher.await {
                log_warn!("Status pusher ended abnormally: {}", e);
            }
        }
    }
}

impl ProgressSink for StatusReporter {
    fn report(&mut self, message: String, important: bool) {
        self.progress_at(Instant::now(), message, important);
    }
}

async fn run_pusher(controller: Arc<dyn Controller>, mut rx: mpsc::UnboundedReceiver<WorkerStatus>) {
    while let Some(status) = rx.recv().await {
        if let Err(e) = controller.push_status(&status).await {
            log_warn!("Status push failed: {}", e);
        }
    }
}
