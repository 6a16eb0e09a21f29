//! Orchestration events and their fan-out.

use agentrun_core::ActiveDelivery;
use agentrun_core::ClassifiedError;
use agentrun_core::ErrorKind;
use agentrun_protocol::RunId;
use agentrun_protocol::RunStatus;
use serde::Serialize;

/// Why a run was spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunRole {
    Candidate,
    Synthesis,
    Child,
}

impl RunRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Synthesis => "synthesis",
            Self::Child => "child",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    RunSpawned {
        run_id: RunId,
        role: RunRole,
        #[serde(skip_serializing_if = "Option::is_none")]
        batch_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<RunId>,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
    },
    CandidateCollected {
        batch_id: String,
        run_id: RunId,
        /// Zero-based position in completion order.
        position: usize,
    },
    SynthesisStarted {
        batch_id: String,
        run_id: RunId,
        candidates: usize,
    },
    BatchCompleted {
        batch_id: String,
        candidates: usize,
        runs: usize,
    },
    BatchFailed {
        batch_id: String,
        kind: ErrorKind,
        message: String,
    },
    ParentNotified {
        child_run_id: RunId,
        parent_run_id: RunId,
        delivered: bool,
    },
    ParentResumed {
        child_run_id: RunId,
        parent_run_id: RunId,
    },
    /// A child finished but its parent could not be told. Not retried.
    NotificationFailed {
        child_run_id: RunId,
        parent_run_id: RunId,
        kind: ErrorKind,
        message: String,
    },
}

/// Logs every event and forwards it to an optional subscriber.
#[derive(Clone, Default)]
pub struct EventEmitter {
    tx: Option<async_channel::Sender<OrchestratorEvent>>,
}

impl EventEmitter {
    /// Emitter that only logs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emitter paired with a receiver that sees every event.
    pub fn channel() -> (Self, async_channel::Receiver<OrchestratorEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        match &event {
            OrchestratorEvent::NotificationFailed {
                child_run_id,
                parent_run_id,
                kind,
                message,
            } => tracing::error!(
                child_run_id = %child_run_id,
                parent_run_id = %parent_run_id,
                kind = %kind,
                error = %message,
                "parent notification failed"
            ),
            OrchestratorEvent::BatchFailed {
                batch_id,
                kind,
                message,
            } => tracing::warn!(batch_id = %batch_id, kind = %kind, error = %message, "batch failed"),
            other => tracing::info!(event = ?other, "orchestrator event"),
        }

        if let Some(tx) = &self.tx {
            // A dropped receiver only means nobody is listening anymore.
            let _ = tx.try_send(event);
        }
    }

    pub fn run_spawned(
        &self,
        run_id: RunId,
        role: RunRole,
        batch_id: Option<String>,
        parent_run_id: Option<RunId>,
    ) {
        self.emit(OrchestratorEvent::RunSpawned {
            run_id,
            role,
            batch_id,
            parent_run_id,
        });
    }

    pub fn run_finished(&self, run_id: RunId, status: RunStatus) {
        self.emit(OrchestratorEvent::RunFinished { run_id, status });
    }

    pub fn parent_notified(
        &self,
        child_run_id: RunId,
        parent_run_id: RunId,
        delivery: ActiveDelivery,
    ) {
        self.emit(OrchestratorEvent::ParentNotified {
            child_run_id,
            parent_run_id,
            delivered: delivery == ActiveDelivery::Delivered,
        });
    }

    pub fn notification_failed(
        &self,
        child_run_id: RunId,
        parent_run_id: RunId,
        error: &ClassifiedError,
    ) {
        self.emit(OrchestratorEvent::NotificationFailed {
            child_run_id,
            parent_run_id,
            kind: error.kind,
            message: error.to_string(),
        });
    }
}
