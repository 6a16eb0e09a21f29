//! Child run spawning with parent registration.

use std::sync::Arc;

use agentrun_core::RemoteRunGateway;
use agentrun_protocol::CreateRunRequest;
use agentrun_protocol::RunHandle;
use agentrun_protocol::RunId;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::EventEmitter;
use crate::events::RunRole;
use crate::registry::OrchestrationLinkRegistry;

/// Creates runs on behalf of an orchestrating run and records who to tell
/// when they finish.
pub struct ChildRunSpawner {
    gateway: Arc<dyn RemoteRunGateway>,
    registry: Arc<OrchestrationLinkRegistry>,
    events: EventEmitter,
}

impl ChildRunSpawner {
    pub fn new(
        gateway: Arc<dyn RemoteRunGateway>,
        registry: Arc<OrchestrationLinkRegistry>,
    ) -> Self {
        Self {
            gateway,
            registry,
            events: EventEmitter::new(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Creates a run and, when `parent` is given, links it so the parent is
    /// notified on completion.
    ///
    /// A link failure is returned even though the run was created; the run is
    /// then untracked and its parent will not hear about it.
    pub async fn spawn_child(
        &self,
        request: &CreateRunRequest,
        parent: Option<&RunId>,
        cancel: &CancellationToken,
    ) -> Result<RunHandle> {
        let handle = self.gateway.create(request, cancel).await?;

        if let Some(parent) = parent {
            if let Err(err) = self.registry.link(&handle.run_id, parent) {
                tracing::error!(
                    child_run_id = %handle.run_id,
                    parent_run_id = %parent,
                    error = %err,
                    "spawned child run could not be linked to its parent"
                );
                return Err(err.into());
            }
        }

        tracing::info!(
            run_id = %handle.run_id,
            parent_run_id = parent.map(tracing::field::display),
            "spawned child run"
        );
        self.events
            .run_spawned(handle.run_id.clone(), RunRole::Child, None, parent.cloned());
        Ok(handle)
    }
}
