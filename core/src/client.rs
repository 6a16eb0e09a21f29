//! HTTP implementation of [`RemoteRunGateway`].

use std::time::Duration;

use agentrun_protocol::CreateRunRequest;
use agentrun_protocol::OrganizationId;
use agentrun_protocol::RunFilters;
use agentrun_protocol::RunHandle;
use agentrun_protocol::RunId;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::config::ConfigError;
use crate::error::ClassifiedError;
use crate::error::ErrorKind;
use crate::error::RawError;
use crate::error::classify;
use crate::gateway::RemoteRunGateway;
use crate::retry::RetryPolicy;
use crate::retry::retry_with_policy;

/// Upper bound for one HTTP exchange; retries get their own.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpRunGateway {
    client: Client,
    base_url: Url,
    organization_id: OrganizationId,
    api_token: String,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct ResumeBody<'a> {
    agent_run_id: &'a RunId,
    prompt: &'a str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Page { items: Vec<RunHandle> },
    Bare(Vec<RunHandle>),
}

impl HttpRunGateway {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("agentrun/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ConfigError::Invalid(format!("failed to build HTTP client: {err}")))?;
        if config.base_url.cannot_be_a_base() {
            return Err(ConfigError::Invalid(format!(
                "base_url `{}` cannot carry a path",
                config.base_url
            )));
        }
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            organization_id: config.organization_id.clone(),
            api_token: config.api_token.clone(),
            retry: config.retry,
        })
    }

    /// Same gateway with a different retry policy, for callers that need to
    /// be more or less patient than the process default.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["v1", "organizations", self.organization_id.as_str()])
                .extend(segments);
        }
        url
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ClassifiedError> {
        let response = request
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|err| classify(&RawError::from_reqwest(&err)))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect();
            let body = response.text().await.ok();
            return Err(classify(&RawError::Http {
                status: status.as_u16(),
                headers,
                body,
            }));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| classify(&RawError::from_reqwest(&err)))?;
        serde_json::from_slice(&bytes).map_err(|err| classify(&RawError::Decode(err.to_string())))
    }
}

#[async_trait]
impl RemoteRunGateway for HttpRunGateway {
    async fn create(
        &self,
        request: &CreateRunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunHandle, ClassifiedError> {
        let url = self.endpoint(&["agent", "run"]);
        retry_with_policy(&self.retry, cancel, "create", || {
            self.send_once(self.client.post(url.clone()).json(request))
        })
        .await
    }

    async fn get(
        &self,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> Result<RunHandle, ClassifiedError> {
        let url = self.endpoint(&["agent", "run", run_id.as_str()]);
        retry_with_policy(&self.retry, cancel, "get", || {
            self.send_once(self.client.get(url.clone()))
        })
        .await
    }

    async fn resume(
        &self,
        run_id: &RunId,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<RunHandle, ClassifiedError> {
        if prompt.trim().is_empty() {
            return Err(ClassifiedError::new(
                ErrorKind::Validation,
                "resume prompt must not be empty",
            ));
        }
        let url = self.endpoint(&["agent", "run", "resume"]);
        let body = ResumeBody {
            agent_run_id: run_id,
            prompt,
        };
        retry_with_policy(&self.retry, cancel, "resume", || {
            self.send_once(self.client.post(url.clone()).json(&body))
        })
        .await
    }

    async fn list(
        &self,
        filters: &RunFilters,
        cancel: &CancellationToken,
    ) -> Result<Vec<RunHandle>, ClassifiedError> {
        let url = self.endpoint(&["agent", "runs"]);
        let page: ListResponse = retry_with_policy(&self.retry, cancel, "list", || {
            self.send_once(self.client.get(url.clone()).query(filters))
        })
        .await?;
        Ok(match page {
            ListResponse::Page { items } => items,
            ListResponse::Bare(items) => items,
        })
    }
}

impl std::fmt::Debug for HttpRunGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRunGateway")
            .field("base_url", &self.base_url.as_str())
            .field("organization_id", &self.organization_id)
            .field("api_token", &"[REDACTED]")
            .field("retry", &self.retry)
            .finish()
    }
}
