//! Wire-independent data model for remote agent runs.
//!
//! Everything here is plain data: the gateway in `agentrun-core` produces
//! [`RunHandle`]s and the orchestrator consumes them.

pub mod link;
pub mod multi_run;
pub mod run;

pub use link::OrchestrationLink;
pub use multi_run::MultiRunRequest;
pub use multi_run::MultiRunResult;
pub use run::CreateRunRequest;
pub use run::OrganizationId;
pub use run::RunFilters;
pub use run::RunHandle;
pub use run::RunId;
pub use run::RunStatus;
