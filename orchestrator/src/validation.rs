//! Up-front checks on a multi-run request.

use std::time::Duration;

use agentrun_protocol::MultiRunRequest;

use crate::error::OrchestratorErr;

/// Validates `request` and returns the batch's wall-clock budget.
pub fn validate_request(
    request: &MultiRunRequest,
    max_concurrency: usize,
) -> Result<Duration, OrchestratorErr> {
    if request.prompt.trim().is_empty() {
        return Err(invalid("prompt must not be empty"));
    }
    if request.concurrency < 1 {
        return Err(invalid("concurrency must be at least 1"));
    }
    if request.concurrency > max_concurrency {
        return Err(invalid(format!(
            "concurrency {} exceeds the configured maximum of {max_concurrency}",
            request.concurrency
        )));
    }
    check_unit_interval("temperature", request.temperature)?;
    check_unit_interval("synthesis_temperature", request.synthesis_temperature)?;

    let timeout = request.timeout_seconds;
    if !(timeout.is_finite() && timeout > 0.0) {
        return Err(invalid(format!(
            "timeout_seconds must be a positive number, got {timeout}"
        )));
    }
    Duration::try_from_secs_f64(timeout)
        .map_err(|err| invalid(format!("timeout_seconds {timeout}: {err}")))
}

fn check_unit_interval(name: &str, value: f64) -> Result<(), OrchestratorErr> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be within [0, 1], got {value}")))
    }
}

fn invalid(message: impl Into<String>) -> OrchestratorErr {
    OrchestratorErr::InvalidRequest(message.into())
}
