use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::run::RunId;

/// A child run waiting to report back to the run that spawned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationLink {
    pub child_run_id: RunId,
    pub parent_run_id: RunId,
    pub created_at: DateTime<Utc>,
}

impl OrchestrationLink {
    pub fn new(child_run_id: RunId, parent_run_id: RunId) -> Self {
        Self {
            child_run_id,
            parent_run_id,
            created_at: Utc::now(),
        }
    }
}
