//! Resilient calls against the remote agent run service.
//!
//! Failures are classified once ([`error`]), retried by policy ([`retry`])
//! inside the gateway ([`client`]), and runs are awaited by the [`poller`].

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod poller;
pub mod retry;

pub use client::HttpRunGateway;
pub use config::ActiveParentPolicy;
pub use config::Config;
pub use config::ConfigError;
pub use config::ConfigToml;
pub use error::ClassifiedError;
pub use error::ErrorKind;
pub use error::RawError;
pub use error::classify;
pub use gateway::ActiveDelivery;
pub use gateway::RemoteRunGateway;
pub use poller::RunPoller;
pub use retry::RetryPolicy;
pub use retry::retry_with_policy;
