//! Multi-run fan-out: N candidate runs, then one synthesis run.

use std::sync::Arc;
use std::time::Duration;

use agentrun_core::ClassifiedError;
use agentrun_core::Config;
use agentrun_core::ErrorKind;
use agentrun_core::RemoteRunGateway;
use agentrun_core::RunPoller;
use agentrun_protocol::CreateRunRequest;
use agentrun_protocol::MultiRunRequest;
use agentrun_protocol::MultiRunResult;
use agentrun_protocol::RunHandle;
use agentrun_protocol::RunStatus;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::error::OrchestratorErr;
use crate::error::Result;
use crate::events::EventEmitter;
use crate::events::OrchestratorEvent;
use crate::events::RunRole;
use crate::synthesis::build_synthesis_prompt;
use crate::validation::validate_request;

/// Fans a prompt out to concurrent candidate runs and synthesizes their
/// outputs into one answer.
pub struct MultiRunCoordinator {
    gateway: Arc<dyn RemoteRunGateway>,
    poller: RunPoller,
    events: EventEmitter,
    max_concurrency: usize,
    candidate_token_limit: usize,
    /// Parent of every batch token; cancelling it aborts all batches.
    cancel: CancellationToken,
}

impl MultiRunCoordinator {
    pub fn new(gateway: Arc<dyn RemoteRunGateway>, config: &Config) -> Self {
        let poller = RunPoller::new(gateway.clone()).with_interval(config.poll_interval);
        Self {
            gateway,
            poller,
            events: EventEmitter::new(),
            max_concurrency: config.max_concurrency,
            candidate_token_limit: config.candidate_token_limit,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poller = self.poller.with_interval(interval);
        self
    }

    /// Runs one batch to completion.
    ///
    /// Candidates appear in the order their completion was observed.
    /// `agent_runs` lists every spawned run in spawn order, synthesis last.
    #[instrument(
        skip_all,
        fields(batch_id = tracing::field::Empty, concurrency = request.concurrency)
    )]
    pub async fn run(&self, request: &MultiRunRequest) -> Result<MultiRunResult> {
        let budget = validate_request(request, self.max_concurrency)?;
        let batch_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("batch_id", batch_id.as_str());

        let deadline = Instant::now() + budget;
        let batch_cancel = self.cancel.child_token();
        let _expiry = ExpiryTimer::arm(deadline, batch_cancel.clone());

        let outcome = self
            .run_batch(request, &batch_id, deadline, &batch_cancel)
            .await;
        // Anything still in flight belongs to a finished batch.
        batch_cancel.cancel();

        match &outcome {
            Ok(result) => self.events.emit(OrchestratorEvent::BatchCompleted {
                batch_id,
                candidates: result.candidates.len(),
                runs: result.agent_runs.len(),
            }),
            Err(err) => self.events.emit(OrchestratorEvent::BatchFailed {
                batch_id,
                kind: err.kind(),
                message: err.to_string(),
            }),
        }
        outcome
    }

    async fn run_batch(
        &self,
        request: &MultiRunRequest,
        batch_id: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<MultiRunResult> {
        let concurrency = request.concurrency;
        let mut tasks = JoinSet::new();
        for index in 0..concurrency {
            let task = CandidateTask {
                gateway: self.gateway.clone(),
                poller: self.poller.clone(),
                events: self.events.clone(),
                request: candidate_request(request, batch_id, index),
                batch_id: batch_id.to_string(),
                index,
                deadline,
                cancel: cancel.clone(),
            };
            tasks.spawn(task.run());
        }

        let mut slots: Vec<Option<RunHandle>> = vec![None; concurrency];
        let mut candidates = Vec::new();
        let mut last_error: Option<ClassifiedError> = None;
        let mut expired: Option<ClassifiedError> = None;

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(error = %err, "candidate task aborted");
                    last_error = Some(ClassifiedError::new(
                        ErrorKind::Unknown,
                        format!("candidate task aborted: {err}"),
                    ));
                    continue;
                }
            };
            let CandidateOutcome {
                index,
                handle,
                error,
            } = outcome;
            if let Some(handle) = &handle {
                slots[index] = Some(handle.clone());
            }

            match (handle, error) {
                // Only the shared budget running out fails the batch; a
                // candidate's own transport timeout is an ordinary failure.
                (_, Some(err))
                    if err.kind == ErrorKind::Timeout
                        && (cancel.is_cancelled() || Instant::now() >= deadline) =>
                {
                    if expired.is_none() {
                        tracing::warn!(batch_index = index, error = %err, "batch budget exhausted, cancelling batch");
                        cancel.cancel();
                        expired = Some(err);
                    }
                }
                (_, Some(err)) => {
                    tracing::warn!(batch_index = index, error = %err, "candidate failed");
                    last_error = Some(err);
                }
                (Some(handle), None) => match handle.completed_result() {
                    Some(text) if !text.trim().is_empty() => {
                        self.events.emit(OrchestratorEvent::CandidateCollected {
                            batch_id: batch_id.to_string(),
                            run_id: handle.run_id.clone(),
                            position: candidates.len(),
                        });
                        candidates.push(text.to_string());
                    }
                    _ => {
                        tracing::info!(
                            run_id = %handle.run_id,
                            status = %handle.status,
                            "candidate excluded"
                        );
                        last_error = Some(excluded_error(&handle));
                    }
                },
                (None, None) => {}
            }
        }

        if let Some(err) = expired {
            return Err(OrchestratorErr::Remote(err));
        }

        let mut agent_runs: Vec<RunHandle> = slots.into_iter().flatten().collect();
        if candidates.is_empty() {
            return Err(OrchestratorErr::NoSuccessfulCandidates {
                attempted: concurrency,
                last_error,
                agent_runs,
            });
        }

        let synthesis = self
            .synthesize(request, batch_id, &candidates, deadline, cancel)
            .await?;
        agent_runs.push(synthesis.handle);

        Ok(MultiRunResult {
            final_output: synthesis.output,
            candidates,
            agent_runs,
        })
    }

    async fn synthesize(
        &self,
        request: &MultiRunRequest,
        batch_id: &str,
        candidates: &[String],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Synthesis> {
        if cancel.is_cancelled() || Instant::now() >= deadline {
            return Err(ClassifiedError::deadline_exceeded(
                "batch budget exhausted before synthesis could start",
            )
            .into());
        }

        let prompt = build_synthesis_prompt(
            &request.prompt,
            request.synthesis_prompt.as_deref(),
            candidates,
            self.candidate_token_limit,
        );
        let mut create = base_request(request, prompt, request.synthesis_temperature, batch_id);
        create
            .metadata
            .insert("role".to_string(), Value::from(RunRole::Synthesis.as_str()));
        create
            .metadata
            .insert("candidate_count".to_string(), Value::from(candidates.len()));

        let created = self.gateway.create(&create, cancel).await?;
        self.events.run_spawned(
            created.run_id.clone(),
            RunRole::Synthesis,
            Some(batch_id.to_string()),
            None,
        );
        self.events.emit(OrchestratorEvent::SynthesisStarted {
            batch_id: batch_id.to_string(),
            run_id: created.run_id.clone(),
            candidates: candidates.len(),
        });

        let handle = self
            .poller
            .await_terminal(&created.run_id, deadline, cancel)
            .await?;
        self.events
            .run_finished(handle.run_id.clone(), handle.status);

        if handle.status != RunStatus::Completed {
            let reason = handle
                .error_message()
                .unwrap_or_else(|| "no error reported".to_string());
            return Err(OrchestratorErr::SynthesisFailed {
                run_id: handle.run_id,
                status: handle.status,
                reason,
            });
        }
        let Some(output) = handle
            .completed_result()
            .filter(|text| !text.trim().is_empty())
            .map(str::to_string)
        else {
            return Err(OrchestratorErr::SynthesisFailed {
                run_id: handle.run_id,
                status: handle.status,
                reason: "completed without a result".to_string(),
            });
        };
        Ok(Synthesis { output, handle })
    }
}

struct Synthesis {
    output: String,
    handle: RunHandle,
}

struct CandidateOutcome {
    index: usize,
    /// Last snapshot seen; `None` when creation failed.
    handle: Option<RunHandle>,
    error: Option<ClassifiedError>,
}

struct CandidateTask {
    gateway: Arc<dyn RemoteRunGateway>,
    poller: RunPoller,
    events: EventEmitter,
    request: CreateRunRequest,
    batch_id: String,
    index: usize,
    deadline: Instant,
    cancel: CancellationToken,
}

impl CandidateTask {
    async fn run(self) -> CandidateOutcome {
        let created = match self.gateway.create(&self.request, &self.cancel).await {
            Ok(created) => created,
            Err(err) => {
                return CandidateOutcome {
                    index: self.index,
                    handle: None,
                    error: Some(err),
                };
            }
        };
        self.events.run_spawned(
            created.run_id.clone(),
            RunRole::Candidate,
            Some(self.batch_id.clone()),
            None,
        );

        match self
            .poller
            .await_terminal(&created.run_id, self.deadline, &self.cancel)
            .await
        {
            Ok(handle) => {
                self.events.run_finished(handle.run_id.clone(), handle.status);
                CandidateOutcome {
                    index: self.index,
                    handle: Some(handle),
                    error: None,
                }
            }
            Err(err) => CandidateOutcome {
                index: self.index,
                handle: Some(created),
                error: Some(err),
            },
        }
    }
}

/// Cancels `token` once `deadline` passes. Dropping the timer disarms it.
struct ExpiryTimer(JoinHandle<()>);

impl ExpiryTimer {
    fn arm(deadline: Instant, token: CancellationToken) -> Self {
        Self(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::debug!("batch deadline reached");
                    token.cancel();
                }
            }
        }))
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn base_request(
    request: &MultiRunRequest,
    prompt: String,
    temperature: f64,
    batch_id: &str,
) -> CreateRunRequest {
    let mut create = CreateRunRequest::new(prompt);
    create.model = request.model.clone();
    create.temperature = Some(temperature);
    create.repo_id = request.repo_id;
    create.metadata = request.metadata.clone();
    create
        .metadata
        .insert("batch_id".to_string(), Value::from(batch_id));
    create
}

fn candidate_request(request: &MultiRunRequest, batch_id: &str, index: usize) -> CreateRunRequest {
    let mut create = base_request(request, request.prompt.clone(), request.temperature, batch_id);
    create
        .metadata
        .insert("batch_index".to_string(), Value::from(index));
    create
        .metadata
        .insert("batch_size".to_string(), Value::from(request.concurrency));
    create
        .metadata
        .insert("role".to_string(), Value::from(RunRole::Candidate.as_str()));
    create
}

fn excluded_error(handle: &RunHandle) -> ClassifiedError {
    let reason = handle
        .error_message()
        .unwrap_or_else(|| "no result reported".to_string());
    ClassifiedError::new(
        ErrorKind::Server,
        format!("run {} ended as {}: {reason}", handle.run_id, handle.status),
    )
}
