use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SchemaError, TransportError};

/// Role under evaluation. Every request must name an address for it.
pub const EVALUATED_ROLE: &str = "purple_agent";
const EVALUATED_ROLE_ALIASES: &[&str] = &["purple"];

pub const DEFAULT_MAX_STEPS: u32 = 8;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentRequest {
    pub participants: BTreeMap<String, String>,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl AssessmentRequest {
    pub fn new(participants: BTreeMap<String, String>) -> Self {
        Self {
            participants,
            config: Map::new(),
        }
    }

    pub fn with_config_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.participants.is_empty() {
            return Err(SchemaError::NoParticipants);
        }

        let (role, address) = self
            .evaluated_participant()
            .ok_or(SchemaError::MissingParticipant(EVALUATED_ROLE))?;

        check_base_url(address)
            .map(|_| ())
            .map_err(|reason| SchemaError::InvalidAddress {
                role: role.to_string(),
                address: address.to_string(),
                reason,
            })
    }

    /// Role name and address of the participant being evaluated.
    pub fn evaluated_participant(&self) -> Option<(&str, &str)> {
        std::iter::once(EVALUATED_ROLE)
            .chain(EVALUATED_ROLE_ALIASES.iter().copied())
            .find_map(|role| {
                self.participants
                    .get_key_value(role)
                    .map(|(role, address)| (role.as_str(), address.as_str()))
            })
    }
}

pub(crate) fn check_base_url(address: &str) -> Result<reqwest::Url, String> {
    let url = reqwest::Url::parse(address).map_err(|error| error.to_string())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("missing host".to_string());
    }
    Ok(url)
}

/// Config keys the orchestrator understands. Everything else in the request's
/// config map is handed to the environment untouched.
#[derive(Debug, Clone, Default, JsonSchema)]
pub struct AssessmentConfig {
    /// Maximum number of steps per episode (default 8).
    pub max_steps: Option<u32>,
    /// Seconds to wait for the participant on each step (default 30).
    pub timeout_secs: Option<u64>,
    /// Specific task to run; a random task is chosen when omitted.
    pub task_id: Option<String>,
    /// Base URL of the tool backend the environment talks to. `fhir_base_url` is accepted as well.
    pub backend_url: Option<String>,
    #[schemars(skip)]
    raw: Map<String, Value>,
}

impl AssessmentConfig {
    /// Reads recognized keys without rejecting the request on type mismatches.
    pub fn from_map(config: &Map<String, Value>) -> Self {
        Self {
            max_steps: lenient_u64(config, "max_steps").map(|v| v.min(u32::MAX as u64) as u32),
            timeout_secs: lenient_u64(config, "timeout_secs"),
            task_id: lenient_string(config, "task_id"),
            backend_url: lenient_string(config, "backend_url")
                .or_else(|| lenient_string(config, "fhir_base_url")),
            raw: config.clone(),
        }
    }

    pub fn with_defaults(mut self, defaults: &RunDefaults) -> Self {
        self.max_steps.get_or_insert(defaults.max_steps);
        self.timeout_secs.get_or_insert(defaults.timeout.as_secs());
        self
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps.unwrap_or(DEFAULT_MAX_STEPS)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Any config value, recognized or not.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    pub fn json_schema() -> Value {
        let schema = schemars::schema_for!(AssessmentConfig);
        serde_json::to_value(schema.schema).unwrap_or(Value::Null)
    }
}

fn lenient_u64(config: &Map<String, Value>, key: &str) -> Option<u64> {
    let value = config.get(key)?;
    let parsed = match value {
        Value::Null => return None,
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    };
    if parsed.is_none() {
        tracing::warn!(key, %value, "ignoring config value of unexpected type");
    }
    parsed
}

fn lenient_string(config: &Map<String, Value>, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::Null => None,
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Server-wide defaults for keys a request leaves out.
#[derive(Debug, Clone, Copy)]
pub struct RunDefaults {
    pub max_steps: u32,
    pub timeout: Duration,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// One line of the assessment stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssessmentEvent {
    TaskUpdate(TaskUpdate),
    Artifact(Artifact),
}

impl AssessmentEvent {
    pub fn is_artifact(&self) -> bool {
        matches!(self, AssessmentEvent::Artifact(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub timestamp: DateTime<Utc>,
    pub step: u32,
    pub max_steps: u32,
    pub status: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TaskUpdate {
    pub fn new(step: u32, max_steps: u32, status: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            step,
            max_steps,
            status: status.into(),
            done: false,
            metadata: Map::new(),
        }
    }

    pub fn done(mut self) -> Self {
        self.done = true;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    EvaluationResult,
    EvaluationError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_type: ArtifactKind,
    /// Always true: the artifact closes the stream.
    pub done: bool,
    pub content: ArtifactContent,
    pub timestamp: DateTime<Utc>,
}

impl Artifact {
    pub fn result(report: EvaluationReport) -> Self {
        Self {
            artifact_type: ArtifactKind::EvaluationResult,
            done: true,
            content: ArtifactContent::Result(report),
            timestamp: Utc::now(),
        }
    }

    pub fn error(report: ErrorReport) -> Self {
        Self {
            artifact_type: ArtifactKind::EvaluationError,
            done: true,
            content: ArtifactContent::Error(report),
            timestamp: Utc::now(),
        }
    }

    pub fn score(&self) -> f64 {
        match &self.content {
            ArtifactContent::Result(report) => report.score,
            ArtifactContent::Error(report) => report.score,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArtifactContent {
    Result(EvaluationReport),
    Error(ErrorReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Finished,
    MaxStepsReached,
    Errored,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::Finished => "finished",
            Termination::MaxStepsReached => "max_steps_reached",
            Termination::Errored => "errored",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub assessment_id: String,
    pub task_id: String,
    pub subject_id: Option<String>,
    pub total_steps: u32,
    pub evaluation: EvaluationOutcome,
    pub final_summary: Option<String>,
    /// The evaluator's free-text verdict.
    pub summary: String,
    pub termination: Termination,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub correct: bool,
    pub extracted_answer: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Environment,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Environment => "environment",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub assessment_id: Option<String>,
    pub error: String,
    pub error_kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_failure: Option<String>,
    pub message: String,
    pub task_id: Option<String>,
    pub subject_id: Option<String>,
    pub total_steps: u32,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            assessment_id: None,
            error: error.into(),
            error_kind: kind,
            transport_failure: None,
            message: "Assessment failed".to_string(),
            task_id: None,
            subject_id: None,
            total_steps: 0,
            score: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn transport(error: &TransportError) -> Self {
        let mut report = Self::new(ErrorKind::Transport, error.to_string());
        report.transport_failure = Some(error.kind().to_string());
        report
    }
}

/// Envelope sent to the remote participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RemoteMessage {
    pub fn observation(content: impl Into<String>) -> Self {
        let mut metadata = Map::new();
        metadata.insert("type".to_string(), Value::String("observation".to_string()));
        Self {
            role: "green_agent".to_string(),
            content: content.into(),
            metadata,
        }
    }
}

/// What the participant wants to do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ParticipantAction {
    CallTool {
        tool_name: String,
        #[serde(default)]
        arguments: Value,
    },
    Finish {
        final_summary: String,
    },
}

impl ParticipantAction {
    pub fn call_tool(tool_name: impl Into<String>, arguments: Value) -> Self {
        ParticipantAction::CallTool {
            tool_name: tool_name.into(),
            arguments,
        }
    }

    pub fn finish(final_summary: impl Into<String>) -> Self {
        ParticipantAction::Finish {
            final_summary: final_summary.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ParticipantAction::CallTool { .. } => "call_tool",
            ParticipantAction::Finish { .. } => "finish",
        }
    }

    /// Parses an action from free text, tolerating a surrounding code fence.
    pub fn parse(text: &str) -> Result<Self, String> {
        let trimmed = text.trim();
        let body = extract_json_from_fenced_block(trimmed).unwrap_or_else(|| trimmed.to_string());
        serde_json::from_str(&body).map_err(|error| error.to_string())
    }

    /// Decodes the body a participant returned for one exchange.
    ///
    /// Accepted shapes are `{"action": {...}}`, a bare action object, and
    /// `{"content": "<action json>"}`.
    pub fn from_response(response: Value) -> Result<Self, String> {
        let Value::Object(mut object) = response else {
            return Err("response is not a JSON object".to_string());
        };

        if object.get("action").map_or(false, Value::is_object) {
            let action = object.remove("action").unwrap_or_default();
            return serde_json::from_value(action).map_err(|error| error.to_string());
        }

        if object.get("action").map_or(false, Value::is_string) {
            return serde_json::from_value(Value::Object(object))
                .map_err(|error| error.to_string());
        }

        match object.get("content") {
            Some(Value::String(content)) => Self::parse(content),
            _ => Err("response carries neither an action nor content".to_string()),
        }
    }
}

fn extract_json_from_fenced_block(content: &str) -> Option<String> {
    let start = content.find("```json").or_else(|| content.find("```"))?;
    let remainder = &content[start..];
    let line_break = remainder.find('\n')?;
    let after_language = &remainder[line_break + 1..];
    let end = after_language.find("```")?;
    Some(after_language[..end].trim().to_string())
}
