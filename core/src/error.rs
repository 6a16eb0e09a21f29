//! Failure taxonomy shared by every caller of the remote run service.
//!
//! [`classify`] turns whatever went wrong on the wire ([`RawError`]) into a
//! [`ClassifiedError`], and callers decide between retrying and failing fast
//! by looking at [`ClassifiedError::retryable`] only.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

/// Longest slice of a raw response body kept in an error message.
const MAX_BODY_MESSAGE_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimit,
    Auth,
    Validation,
    NotFound,
    Server,
    Unknown,
}

impl ErrorKind {
    /// Kinds worth another attempt when nothing more specific is known.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::Server
        )
    }
}

/// A failure from the remote run service after classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub retryable: bool,
    /// Server-provided wait before the next attempt (rate limits only).
    #[serde(default, with = "serde_with::As::<Option<serde_with::DurationSecondsWithFrac<f64>>>")]
    pub retry_after: Option<Duration>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Number of attempts made, set only when retries were exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.default_retryable(),
            retry_after: None,
            message: message.into(),
            details: None,
            attempts: None,
        }
    }

    /// A caller-owned budget ran out. Never retried: the budget is gone.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(ErrorKind::Timeout, message)
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub(crate) fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)?;
        if let Some(attempts) = self.attempts {
            write!(f, " (after {attempts} attempts)")?;
        }
        Ok(())
    }
}

impl std::error::Error for ClassifiedError {}

/// What the transport actually observed, before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum RawError {
    /// The service answered with a non-success status.
    Http {
        status: u16,
        headers: Vec<(String, String)>,
        body: Option<String>,
    },
    /// TCP connect, TLS handshake or name resolution failed.
    Connect(String),
    /// The request did not finish in time.
    DeadlineExceeded(String),
    /// The response arrived but could not be decoded.
    Decode(String),
    Other(String),
}

impl RawError {
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            headers: Vec::new(),
            body: Some(body.into()),
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::DeadlineExceeded(err.to_string())
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                headers: Vec::new(),
                body: None,
            }
        } else {
            Self::Other(err.to_string())
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        match self {
            Self::Http { headers, .. } => headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }
}

/// Maps a raw failure onto the closed taxonomy. Total: malformed statuses,
/// bodies and headers degrade to less specific errors, never to a panic.
pub fn classify(raw: &RawError) -> ClassifiedError {
    match raw {
        RawError::Http { status, body, .. } => classify_http(*status, body.as_deref(), raw),
        RawError::Connect(message) => ClassifiedError::new(ErrorKind::Network, message.clone()),
        RawError::DeadlineExceeded(message) => {
            ClassifiedError::new(ErrorKind::Timeout, message.clone())
        }
        RawError::Decode(message) => ClassifiedError::new(
            ErrorKind::Unknown,
            format!("invalid response from run service: {message}"),
        ),
        RawError::Other(message) => ClassifiedError::new(ErrorKind::Unknown, message.clone()),
    }
}

fn classify_http(status: u16, body: Option<&str>, raw: &RawError) -> ClassifiedError {
    let parsed = body.and_then(|body| serde_json::from_str::<Value>(body).ok());
    let message = body_message(status, body, parsed.as_ref());

    match status {
        401 | 403 => ClassifiedError::new(ErrorKind::Auth, message),
        400 | 422 => {
            let fields = parsed.as_ref().map(field_errors).unwrap_or_default();
            let error = ClassifiedError::new(ErrorKind::Validation, message);
            if fields.is_empty() {
                error
            } else {
                error.with_details(json!({ "fields": fields }))
            }
        }
        404 => ClassifiedError::new(ErrorKind::NotFound, message),
        408 => ClassifiedError::new(ErrorKind::Timeout, message),
        429 => {
            let error = ClassifiedError::new(ErrorKind::RateLimit, message);
            match raw.header("retry-after").and_then(parse_retry_after) {
                Some(wait) => error.with_retry_after(wait),
                None => error,
            }
        }
        500.. => ClassifiedError::new(ErrorKind::Server, message),
        _ => ClassifiedError::new(ErrorKind::Unknown, message),
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    let seconds = value.trim().parse::<f64>().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Duration::try_from_secs_f64(seconds).ok()
    } else {
        None
    }
}

fn body_message(status: u16, body: Option<&str>, parsed: Option<&Value>) -> String {
    let from_json = parsed.and_then(|value| {
        ["message", "detail", "error"]
            .iter()
            .find_map(|key| value.get(key))
            .and_then(|field| match field {
                Value::String(text) => Some(text.clone()),
                Value::Object(inner) => inner
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
    });
    if let Some(message) = from_json {
        return message;
    }

    match body.map(str::trim) {
        Some(text) if !text.is_empty() => {
            let mut message: String = text.chars().take(MAX_BODY_MESSAGE_CHARS).collect();
            if text.chars().count() > MAX_BODY_MESSAGE_CHARS {
                message.push_str("...");
            }
            message
        }
        _ => format!("HTTP {status}"),
    }
}

/// Extracts `{field, message}` pairs from the common validation shapes:
/// `{"detail": [{"loc": [...], "msg": ...}]}` and `{"errors": {"field": [...]}}`.
fn field_errors(body: &Value) -> Vec<Value> {
    let mut fields = Vec::new();

    if let Some(Value::Array(items)) = body.get("detail") {
        for item in items {
            let field = match item.get("loc") {
                Some(Value::Array(parts)) => parts
                    .iter()
                    .map(|part| match part {
                        Value::String(name) => name.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("."),
                Some(Value::String(name)) => name.clone(),
                _ => continue,
            };
            let message = item
                .get("msg")
                .or_else(|| item.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("invalid value");
            fields.push(json!({ "field": field, "message": message }));
        }
    }

    if let Some(Value::Object(errors)) = body.get("errors") {
        for (field, messages) in errors {
            let message = match messages {
                Value::Array(list) => list
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("; "),
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            fields.push(json!({ "field": field, "message": message }));
        }
    }

    fields
}
