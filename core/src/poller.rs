//! Polls a single run until it reaches a terminal status.

use std::sync::Arc;
use std::time::Duration;

use agentrun_protocol::RunHandle;
use agentrun_protocol::RunId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::DEFAULT_POLL_INTERVAL;
use crate::error::ClassifiedError;
use crate::gateway::RemoteRunGateway;

#[derive(Clone)]
pub struct RunPoller {
    gateway: Arc<dyn RemoteRunGateway>,
    interval: Duration,
}

impl RunPoller {
    pub fn new(gateway: Arc<dyn RemoteRunGateway>) -> Self {
        Self {
            gateway,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Fixed cadence between polls. A healthy run that is still pending is
    /// not a failure, so there is no backoff here.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the first observed terminal snapshot of `run_id`.
    ///
    /// Fails with a `timeout` error once `deadline` passes or `cancel` fires,
    /// and with the gateway's error once its retries are exhausted. `paused`
    /// runs keep being polled.
    #[instrument(level = "debug", skip(self, cancel), fields(run_id = %run_id))]
    pub async fn await_terminal(
        &self,
        run_id: &RunId,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<RunHandle, ClassifiedError> {
        let mut polls: u32 = 0;
        loop {
            if cancel.is_cancelled() || Instant::now() >= deadline {
                return Err(deadline_error(run_id, polls));
            }

            let handle = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(deadline_error(run_id, polls)),
                _ = tokio::time::sleep_until(deadline) => return Err(deadline_error(run_id, polls)),
                handle = self.gateway.get(run_id, cancel) => handle?,
            };
            polls += 1;

            if handle.is_terminal() {
                tracing::debug!(status = %handle.status, polls, "run reached terminal status");
                return Ok(handle);
            }
            tracing::trace!(status = %handle.status, polls, "run not finished yet");

            let wake = (Instant::now() + self.interval).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(deadline_error(run_id, polls)),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

fn deadline_error(run_id: &RunId, polls: u32) -> ClassifiedError {
    ClassifiedError::deadline_exceeded(format!(
        "run {run_id} did not finish before the deadline ({polls} polls)"
    ))
}
