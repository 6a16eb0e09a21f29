//! Orchestration on top of the remote run service.
//!
//! [`MultiRunCoordinator`] fans one prompt out to several candidate runs and
//! synthesizes their outputs. [`ChildRunSpawner`], [`OrchestrationLinkRegistry`]
//! and [`CompletionNotifier`] let a run spawn children and be told, at most
//! once, when each of them finishes.

pub mod error;
pub mod events;
pub mod notifier;
pub mod registry;
pub mod runtime;
pub mod spawner;
pub mod synthesis;
pub mod truncation;
pub mod validation;

pub use error::NotifyError;
pub use error::OrchestratorErr;
pub use error::RegistryError;
pub use events::EventEmitter;
pub use events::OrchestratorEvent;
pub use events::RunRole;
pub use notifier::CompletionNotifier;
pub use notifier::NotifyOutcome;
pub use registry::OrchestrationLinkRegistry;
pub use runtime::MultiRunCoordinator;
pub use spawner::ChildRunSpawner;
pub use synthesis::DEFAULT_SYNTHESIS_INSTRUCTIONS;
pub use synthesis::build_synthesis_prompt;
pub use validation::validate_request;
