//! The seam between orchestration logic and the remote run service.

use agentrun_protocol::CreateRunRequest;
use agentrun_protocol::RunFilters;
use agentrun_protocol::RunHandle;
use agentrun_protocol::RunId;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ClassifiedError;

/// Result of trying to reach a still-active run out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveDelivery {
    Delivered,
    /// The service exposes no side channel; nothing was sent.
    Unsupported,
}

/// Operations against the remote run service.
///
/// Implementations own retry: a returned error has already been retried as
/// far as the policy allows. Every method must stop promptly once `cancel`
/// fires.
#[async_trait]
pub trait RemoteRunGateway: Send + Sync {
    async fn create(
        &self,
        request: &CreateRunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunHandle, ClassifiedError>;

    async fn get(&self, run_id: &RunId, cancel: &CancellationToken)
    -> Result<RunHandle, ClassifiedError>;

    /// Continues a paused or finished run with an additional prompt.
    async fn resume(
        &self,
        run_id: &RunId,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<RunHandle, ClassifiedError>;

    async fn list(
        &self,
        filters: &RunFilters,
        cancel: &CancellationToken,
    ) -> Result<Vec<RunHandle>, ClassifiedError>;

    /// Hands `message` to a run that is still pending or running.
    async fn notify_active(
        &self,
        _run_id: &RunId,
        _message: &str,
        _cancel: &CancellationToken,
    ) -> Result<ActiveDelivery, ClassifiedError> {
        Ok(ActiveDelivery::Unsupported)
    }
}
