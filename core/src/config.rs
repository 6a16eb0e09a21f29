//! Runtime configuration.
//!
//! [`ConfigToml`] mirrors the on-disk `config.toml` where every field is
//! optional; [`Config`] is the validated form the gateway and orchestrator
//! are built from. Reading the file and the environment is the caller's job.

use std::path::PathBuf;
use std::time::Duration;

use agentrun_protocol::OrganizationId;
use serde::Deserialize;
use serde::Serialize;
use url::Url;

use crate::retry::RetryPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.codegen.com";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_CONCURRENCY: usize = 20;
/// Estimated-token budget per candidate inside a synthesis prompt.
pub const DEFAULT_CANDIDATE_TOKEN_LIMIT: usize = 5000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("failed to parse config.toml: {0}")]
    Parse(#[from] toml::de::Error),
}

/// What the completion notifier does when a child finishes while its
/// parent is still pending or running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveParentPolicy {
    /// Send the result through the service's side channel, best effort.
    #[default]
    Notify,
    /// Skip the side channel and resume active parents too. A parent is
    /// still resumed at most once until it finishes the resumed turn.
    AlwaysResume,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RetryToml {
    pub max_retries: Option<u32>,
    pub base_delay_seconds: Option<f64>,
    pub backoff_factor: Option<f64>,
    pub max_delay_seconds: Option<f64>,
}

/// Base config deserialized from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigToml {
    pub base_url: Option<String>,
    pub organization_id: Option<OrganizationId>,
    pub api_token: Option<String>,
    #[serde(default)]
    pub retry: RetryToml,
    pub poll_interval_seconds: Option<f64>,
    pub default_timeout_seconds: Option<f64>,
    pub max_concurrency: Option<usize>,
    pub candidate_token_limit: Option<usize>,
    pub active_parent_policy: Option<ActiveParentPolicy>,
    /// JSON file backing the orchestration link registry.
    pub link_store: Option<PathBuf>,
}

impl ConfigToml {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub base_url: Url,
    pub organization_id: OrganizationId,
    pub api_token: String,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub default_timeout: Duration,
    pub max_concurrency: usize,
    pub candidate_token_limit: usize,
    pub active_parent_policy: ActiveParentPolicy,
    pub link_store: Option<PathBuf>,
}

impl TryFrom<ConfigToml> for Config {
    type Error = ConfigError;

    fn try_from(cfg: ConfigToml) -> Result<Self, Self::Error> {
        let base_url = cfg.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let base_url = Url::parse(base_url)
            .map_err(|err| ConfigError::Invalid(format!("base_url `{base_url}`: {err}")))?;

        let organization_id = cfg
            .organization_id
            .ok_or(ConfigError::Missing("organization_id"))?;
        let api_token = cfg
            .api_token
            .filter(|token| !token.trim().is_empty())
            .ok_or(ConfigError::Missing("api_token"))?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: cfg.retry.max_retries.unwrap_or(defaults.max_retries),
            base_delay: seconds_or(
                "retry.base_delay_seconds",
                cfg.retry.base_delay_seconds,
                defaults.base_delay,
            )?,
            backoff_factor: cfg.retry.backoff_factor.unwrap_or(defaults.backoff_factor),
            max_delay: seconds_or(
                "retry.max_delay_seconds",
                cfg.retry.max_delay_seconds,
                defaults.max_delay,
            )?,
        };
        retry.validate()?;

        let poll_interval = seconds_or(
            "poll_interval_seconds",
            cfg.poll_interval_seconds,
            DEFAULT_POLL_INTERVAL,
        )?;
        let default_timeout = seconds_or(
            "default_timeout_seconds",
            cfg.default_timeout_seconds,
            DEFAULT_TIMEOUT,
        )?;

        let max_concurrency = cfg.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY);
        if max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            base_url,
            organization_id,
            api_token,
            retry,
            poll_interval,
            default_timeout,
            max_concurrency,
            candidate_token_limit: cfg
                .candidate_token_limit
                .unwrap_or(DEFAULT_CANDIDATE_TOKEN_LIMIT),
            active_parent_policy: cfg.active_parent_policy.unwrap_or_default(),
            link_store: cfg.link_store,
        })
    }
}

fn seconds_or(
    name: &'static str,
    value: Option<f64>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(seconds) = value else {
        return Ok(default);
    };
    if !(seconds.is_finite() && seconds > 0.0) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be a positive number of seconds, got {seconds}"
        )));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|err| ConfigError::Invalid(format!("{name}: {err}")))
}
