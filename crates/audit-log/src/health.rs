//! Settlement-service health watcher.
//!
//! Probes the wallet/signing service on an interval and notifies operators
//! exactly once per down/up transition, never once per failed probe.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

#[async_trait]
pub trait HealthAlertSink: Send + Sync {
    async fn service_down(&self) -> Result<(), String>;
    async fn service_recovered(&self) -> Result<(), String>;
}

#[derive(Debug, Default)]
pub struct NoopHealthAlertSink;

#[async_trait]
impl HealthAlertSink for NoopHealthAlertSink {
    async fn service_down(&self) -> Result<(), String> {
        Ok(())
    }

    async fn service_recovered(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct HealthWatcher {
    probe: Arc<dyn HealthProbe>,
    sink: Arc<dyn HealthAlertSink>,
    last_up: Arc<Mutex<Option<bool>>>,
}

impl HealthWatcher {
    #[must_use]
    pub fn new(probe: Arc<dyn HealthProbe>, sink: Arc<dyn HealthAlertSink>) -> Self {
        Self {
            probe,
            sink,
            last_up: Arc::new(Mutex::new(None)),
        }
    }

    /// Runs one probe and emits on state transitions only. A healthy first
    /// probe just sets the baseline.
    pub async fn check_once(&self) -> bool {
        let up = self.probe.probe().await;
        let previous = {
            let mut guard = match self.last_up.lock() {
                Ok(guard) => guard,
                Err(_) => return up,
            };
            let previous = *guard;
            *guard = Some(up);
            previous
        };

        match (previous, up) {
            (Some(true) | None, false) => {
                warn!("settlement service went down");
                if let Err(err) = self.sink.service_down().await {
                    warn!(error = %err, "health alert emission failed");
                }
            }
            (Some(false), true) => {
                info!("settlement service recovered");
                if let Err(err) = self.sink.service_recovered().await {
                    warn!(error = %err, "health alert emission failed");
                }
            }
            _ => {}
        }
        up
    }
}

pub fn spawn_health_watch_loop(
    watcher: HealthWatcher,
    poll_interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    break;
                }
                _ = ticker.tick() => {
                    let _ = watcher.check_once().await;
                }
            }
        }
    })
}
