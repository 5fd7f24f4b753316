use std::time::Duration;

use thiserror::Error;

/// A request that cannot start an assessment. Rejected before any stream opens.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("malformed assessment request: {0}")]
    Malformed(String),

    #[error("participants must not be empty")]
    NoParticipants,

    #[error("missing required participant: {0}")]
    MissingParticipant(&'static str),

    #[error("participant '{role}' has an invalid address '{address}': {reason}")]
    InvalidAddress {
        role: String,
        address: String,
        reason: String,
    },
}

/// Failure talking to the remote participant. Never retried by this crate.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid participant address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("participant at {url} is unreachable: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("participant at {url} did not respond within {}s", after.as_secs_f64())]
    Timeout { url: String, after: Duration },

    #[error("participant at {url} responded with status {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("participant at {url} sent a malformed response: {reason}")]
    MalformedResponse { url: String, reason: String },

    #[error("request to participant at {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl TransportError {
    /// Short machine-readable subtype, reported alongside the description.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::InvalidAddress { .. } => "invalid_address",
            TransportError::Unreachable { .. } => "unreachable",
            TransportError::Timeout { .. } => "timeout",
            TransportError::Status { .. } => "status",
            TransportError::MalformedResponse { .. } => "malformed_response",
            TransportError::Request { .. } => "request",
        }
    }

    pub(crate) fn malformed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        TransportError::MalformedResponse {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Reset or evaluation failure inside the domain environment.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("task not found: {0}")]
    UnknownTask(String),

    #[error("task catalog is empty")]
    NoTasks,

    #[error("environment misconfigured: {0}")]
    Misconfigured(String),

    #[error("environment has no active episode")]
    NotStarted,

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// An invalid capability invocation. Recorded as a step outcome, the episode continues.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DomainStepError {
    #[error("unknown capability '{name}'{}", suggestion.as_ref().map(|s| format!(", did you mean '{s}'?")).unwrap_or_default())]
    UnknownCapability {
        name: String,
        suggestion: Option<String>,
    },

    #[error("invalid arguments for '{capability}': {reason}")]
    InvalidArguments { capability: String, reason: String },

    #[error("capability '{capability}' failed: {message}")]
    Execution { capability: String, message: String },
}
