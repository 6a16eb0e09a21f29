//! Routes a finished child run's outcome back to the run that spawned it.

use std::collections::HashMap;
use std::sync::Arc;

use agentrun_core::ActiveDelivery;
use agentrun_core::ActiveParentPolicy;
use agentrun_core::ClassifiedError;
use agentrun_core::RemoteRunGateway;
use agentrun_core::RunPoller;
use agentrun_protocol::RunHandle;
use agentrun_protocol::RunId;
use agentrun_protocol::RunStatus;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::NotifyError;
use crate::events::EventEmitter;
use crate::events::OrchestratorEvent;
use crate::registry::OrchestrationLinkRegistry;

/// What [`CompletionNotifier::notify`] did with a child's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyOutcome {
    /// The child has no registered parent.
    Untracked,
    /// The parent was still active and was told out of band, if the service
    /// supports it.
    Forwarded {
        parent_run_id: RunId,
        delivery: ActiveDelivery,
    },
    /// The parent was resumed with the child's outcome.
    Resumed {
        parent_run_id: RunId,
        parent: RunHandle,
    },
}

/// A parent snapshot the notifier resumed from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParentMarker {
    status: RunStatus,
    completed_at: Option<DateTime<Utc>>,
}

impl ParentMarker {
    fn of(handle: &RunHandle) -> Self {
        Self {
            status: handle.status,
            completed_at: handle.completed_at,
        }
    }
}

#[derive(Debug, Default)]
struct ParentState {
    /// Set by a resume and cleared once the parent is seen to have moved on.
    resumed_from: Option<ParentMarker>,
}

impl ParentState {
    /// Whether our last resume of this parent is still in effect, so a second
    /// one must not be issued.
    fn resume_in_effect(&mut self, parent: &RunHandle) -> bool {
        match &self.resumed_from {
            // Stale read of the very state we already resumed from.
            Some(marker) if *marker == ParentMarker::of(parent) => true,
            Some(_) if parent.status.is_active() => true,
            Some(_) => {
                self.resumed_from = None;
                false
            }
            None => false,
        }
    }
}

type ParentSlot = Arc<Mutex<ParentState>>;

pub struct CompletionNotifier {
    gateway: Arc<dyn RemoteRunGateway>,
    registry: Arc<OrchestrationLinkRegistry>,
    poller: RunPoller,
    events: EventEmitter,
    policy: ActiveParentPolicy,
    parents: std::sync::Mutex<HashMap<RunId, ParentSlot>>,
    cancel: CancellationToken,
}

impl CompletionNotifier {
    pub fn new(
        gateway: Arc<dyn RemoteRunGateway>,
        registry: Arc<OrchestrationLinkRegistry>,
    ) -> Self {
        Self {
            poller: RunPoller::new(gateway.clone()),
            gateway,
            registry,
            events: EventEmitter::new(),
            policy: ActiveParentPolicy::default(),
            parents: std::sync::Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: ActiveParentPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_poller(mut self, poller: RunPoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> ActiveParentPolicy {
        self.policy
    }

    /// Delivers a terminal child's outcome to its parent, at most once.
    ///
    /// Calls for children of the same parent run one at a time, and each
    /// claims its child's link inside that turn, so concurrent calls for the
    /// same child see [`NotifyOutcome::Untracked`] after the first. Failures are reported
    /// through a `NotificationFailed` event and are not retried.
    #[instrument(level = "debug", skip_all, fields(child_run_id = %child.run_id))]
    pub async fn notify(&self, child: &RunHandle) -> Result<NotifyOutcome, NotifyError> {
        if !child.is_terminal() {
            return Err(NotifyError::ChildNotTerminal {
                run_id: child.run_id.clone(),
                status: child.status,
            });
        }
        let Some(parent_run_id) = self.registry.lookup_parent(&child.run_id) else {
            tracing::debug!("child run has no parent to notify");
            return Ok(NotifyOutcome::Untracked);
        };

        // The link is claimed under the parent's lock. While it is still
        // registered the parent's slot cannot be released, so every sibling
        // sees the marker left by an earlier resume.
        let slot = self.parent_slot(&parent_run_id);
        let delivered = {
            let mut state = slot.lock().await;
            match self.registry.take_link(&child.run_id) {
                Ok(Some(_)) => Some(self.deliver(child, &parent_run_id, &mut state).await),
                Ok(None) => None,
                Err(err) => {
                    drop(state);
                    self.release_slot(&parent_run_id, slot);
                    return Err(err.into());
                }
            }
        };
        self.release_slot(&parent_run_id, slot);
        let Some(delivered) = delivered else {
            tracing::debug!("child run was already claimed by a concurrent notification");
            return Ok(NotifyOutcome::Untracked);
        };

        delivered.map_err(|source| {
            self.events
                .notification_failed(child.run_id.clone(), parent_run_id.clone(), &source);
            NotifyError::Delivery {
                child_run_id: child.run_id.clone(),
                parent_run_id,
                source,
            }
        })
    }

    /// Polls `child` until it finishes, then notifies its parent.
    pub async fn watch(
        &self,
        child: &RunId,
        deadline: Instant,
    ) -> Result<NotifyOutcome, NotifyError> {
        let handle = self
            .poller
            .await_terminal(child, deadline, &self.cancel)
            .await
            .map_err(|source| NotifyError::Watch {
                child_run_id: child.clone(),
                source,
            })?;
        self.events.run_finished(handle.run_id.clone(), handle.status);
        self.notify(&handle).await
    }

    async fn deliver(
        &self,
        child: &RunHandle,
        parent_run_id: &RunId,
        state: &mut ParentState,
    ) -> Result<NotifyOutcome, ClassifiedError> {
        let parent = self.gateway.get(parent_run_id, &self.cancel).await?;
        let message = completion_message(child);

        let guarded = state.resume_in_effect(&parent);
        let resume = !guarded
            && (self.policy == ActiveParentPolicy::AlwaysResume || !parent.status.is_active());

        if !resume {
            let delivery = self
                .gateway
                .notify_active(parent_run_id, &message, &self.cancel)
                .await?;
            if delivery == ActiveDelivery::Unsupported {
                tracing::info!(
                    parent_run_id = %parent_run_id,
                    parent_status = %parent.status,
                    "parent is active and the service cannot signal it; result stays on the child run"
                );
            }
            self.events
                .parent_notified(child.run_id.clone(), parent_run_id.clone(), delivery);
            return Ok(NotifyOutcome::Forwarded {
                parent_run_id: parent_run_id.clone(),
                delivery,
            });
        }

        let resumed = self
            .gateway
            .resume(parent_run_id, &message, &self.cancel)
            .await?;
        state.resumed_from = Some(ParentMarker::of(&parent));
        self.events.emit(OrchestratorEvent::ParentResumed {
            child_run_id: child.run_id.clone(),
            parent_run_id: parent_run_id.clone(),
        });
        Ok(NotifyOutcome::Resumed {
            parent_run_id: parent_run_id.clone(),
            parent: resumed,
        })
    }

    fn parent_slot(&self, parent: &RunId) -> ParentSlot {
        self.slots()
            .entry(parent.clone())
            .or_default()
            .clone()
    }

    /// Forgets a parent once nobody waits on it and no linked child remains.
    fn release_slot(&self, parent: &RunId, slot: ParentSlot) {
        let mut slots = self.slots();
        // One reference in the map, one held here.
        if Arc::strong_count(&slot) == 2 && self.registry.children_of(parent).is_empty() {
            slots.remove(parent);
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, ParentSlot>> {
        self.parents
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Prompt handed to a parent run describing how its child ended.
pub fn completion_message(child: &RunHandle) -> String {
    match child.status {
        RunStatus::Completed => format!(
            "Child run {} completed.\n\nResult:\n{}",
            child.run_id,
            child
                .result
                .as_deref()
                .filter(|text| !text.trim().is_empty())
                .unwrap_or("(no result)")
        ),
        status => format!(
            "Child run {} ended as {status}.\n\nError:\n{}",
            child.run_id,
            child
                .error_message()
                .unwrap_or_else(|| "(no error reported)".to_string())
        ),
    }
}
