//! Kubelet health polling.
//!
//! Every 30s the monitor fetches the kubelet healthz endpoint. Three
//! consecutive transport failures signal the daemon's error channel. A
//! response body other than `ok` is logged but does not count toward the
//! threshold: a kubelet answering its socket with an error body is
//! distinguishable from one that is gone entirely.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;

/// Default kubelet healthz endpoint
pub const KUBELET_HEALTHZ_ENDPOINT: &str = "http://localhost:10248/healthz";

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const POLL_TIMEOUT: Duration = Duration::from_secs(30);
const FAILURE_THRESHOLD: u32 = 3;

/// Polls the kubelet healthz endpoint until cancelled.
pub struct KubeletHealthMonitor {
    endpoint: String,
    client: reqwest::Client,
}

impl KubeletHealthMonitor {
    /// Create a monitor for `endpoint` with the per-request timeout.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(POLL_TIMEOUT)
            .build()
            .map_err(|e| Error::host(format!("building healthz client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    /// Poll until `cancel` fires; report threshold breaches on `err_tx`.
    pub async fn run(self, cancel: CancellationToken, err_tx: mpsc::UnboundedSender<Error>) {
        let mut failures = 0u32;
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => match self.probe().await {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        warn!(error = %e, "failed kubelet health check");
                        failures += 1;
                        if failures >= FAILURE_THRESHOLD {
                            let _ = err_tx.send(Error::host(
                                "kubelet health failure threshold reached",
                            ));
                        }
                    }
                },
            }
        }
    }

    async fn probe(&self) -> Result<(), Error> {
        debug!(endpoint = %self.endpoint, "kubelet health probe");
        let response = self
            .client
            .get(self.endpoint.as_str())
            .send()
            .await
            .map_err(|e| Error::host(format!("healthz request: {e}")))?;
        let body = response
            .text()
            .await
            .map_err(|e| Error::host(format!("healthz body: {e}")))?;

        // Soft failure: the endpoint answered, just not with "ok".
        if body != "ok" {
            warn!(%body, "kubelet healthz endpoint returned unexpected body");
        }
        Ok(())
    }
}
