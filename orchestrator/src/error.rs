use std::path::PathBuf;

use agentrun_core::ClassifiedError;
use agentrun_core::ErrorKind;
use agentrun_protocol::RunHandle;
use agentrun_protocol::RunId;
use agentrun_protocol::RunStatus;

pub type Result<T> = std::result::Result<T, OrchestratorErr>;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorErr {
    #[error("invalid multi-run request: {0}")]
    InvalidRequest(String),

    /// Every candidate run failed, so there was nothing to synthesize.
    #[error("no successful candidates: all {attempted} candidate runs failed{}", last_error_suffix(.last_error))]
    NoSuccessfulCandidates {
        attempted: usize,
        last_error: Option<ClassifiedError>,
        agent_runs: Vec<RunHandle>,
    },

    #[error("synthesis run {run_id} ended as {status}: {reason}")]
    SynthesisFailed {
        run_id: RunId,
        status: RunStatus,
        reason: String,
    },

    #[error(transparent)]
    Remote(#[from] ClassifiedError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl OrchestratorErr {
    /// Position of this failure in the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::Validation,
            Self::NoSuccessfulCandidates { last_error, .. } => last_error
                .as_ref()
                .map(|err| err.kind)
                .unwrap_or(ErrorKind::Server),
            Self::SynthesisFailed { .. } => ErrorKind::Server,
            Self::Remote(err) => err.kind,
            Self::Registry(_) => ErrorKind::Unknown,
        }
    }
}

fn last_error_suffix(last_error: &Option<ClassifiedError>) -> String {
    match last_error {
        Some(err) => format!(" (last error: {err})"),
        None => String::new(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to access link store {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("link store {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("run {run_id} has not finished (status {status})")]
    ChildNotTerminal { run_id: RunId, status: RunStatus },

    #[error("failed to watch child run {child_run_id}: {source}")]
    Watch {
        child_run_id: RunId,
        #[source]
        source: ClassifiedError,
    },

    #[error("failed to notify parent {parent_run_id} of child {child_run_id}: {source}")]
    Delivery {
        child_run_id: RunId,
        parent_run_id: RunId,
        #[source]
        source: ClassifiedError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
