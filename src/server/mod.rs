//! HTTP surface: the streaming `/assess` endpoint, liveness and card metadata,
//! plus the legacy session endpoints in [`legacy`].

use std::{convert::Infallible, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_stream::stream;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    environment::EnvironmentFactory,
    error::SchemaError,
    orchestrator::{AssessmentOrchestrator, AssessmentStream},
    participant::HttpParticipant,
    protocol::{
        Artifact, AssessmentConfig, AssessmentEvent, AssessmentRequest, ErrorKind, ErrorReport,
        RunDefaults, EVALUATED_ROLE,
    },
};

pub mod legacy;

pub const SERVICE_NAME: &str = "pruefwerk-green-agent";
const NDJSON: &str = "application/x-ndjson";

pub struct AppState {
    environments: Arc<dyn EnvironmentFactory>,
    defaults: RunDefaults,
    card_url: Option<String>,
    sessions: legacy::SessionStore,
}

impl AppState {
    pub fn new(environments: Arc<dyn EnvironmentFactory>) -> Self {
        Self {
            environments,
            defaults: RunDefaults::default(),
            card_url: None,
            sessions: legacy::SessionStore::new(legacy::DEFAULT_SESSION_TTL),
        }
    }

    pub fn with_defaults(mut self, defaults: RunDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// How long an idle `/reset` session survives.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.sessions.set_ttl(ttl);
        self
    }

    pub fn with_card_url(mut self, url: impl Into<String>) -> Self {
        self.card_url = Some(url.into());
        self
    }

    /// Validates `request` and wires up an orchestrator for it.
    pub fn prepare(&self, request: &AssessmentRequest) -> Result<AssessmentOrchestrator, SchemaError> {
        request.validate()?;
        let (role, address) = request
            .evaluated_participant()
            .ok_or(SchemaError::MissingParticipant(EVALUATED_ROLE))?;

        let config = AssessmentConfig::from_map(&request.config).with_defaults(&self.defaults);
        let participant = HttpParticipant::new(address, config.timeout()).map_err(|error| {
            SchemaError::InvalidAddress {
                role: role.to_string(),
                address: address.to_string(),
                reason: error.to_string(),
            }
        })?;

        Ok(AssessmentOrchestrator::new(
            config,
            self.environments.create(),
            Arc::new(participant),
        ))
    }
}

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    pub message: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/assess", post(assess))
        .route("/health", get(health))
        .route("/card", get(card))
        .route("/evaluate", post(legacy::evaluate))
        .route("/reset", post(legacy::reset))
        .route("/step", post(legacy::step))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn assess(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AssessmentRequest>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(request)) => stream_assessment(&state, &request),
        Err(rejection) => reject(SchemaError::Malformed(rejection.body_text())),
    }
}

pub(crate) fn stream_assessment(state: &AppState, request: &AssessmentRequest) -> Response {
    match state.prepare(request) {
        Ok(orchestrator) => {
            tracing::info!(assessment_id = orchestrator.assessment_id(), "assessment accepted");
            let assessment_id = orchestrator.assessment_id().to_string();
            ndjson(assessment_id, orchestrator.run())
        }
        Err(error) => reject(error),
    }
}

pub(crate) fn reject(error: SchemaError) -> Response {
    tracing::warn!(%error, "rejected assessment request");
    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse {
            success: false,
            data: (),
            message: Some(error.to_string()),
        }),
    )
        .into_response()
}

/// Streams events as NDJSON. A panic in the orchestrator, or a stream that
/// ends without an artifact, is closed with an internal error artifact.
fn ndjson(assessment_id: String, events: AssessmentStream) -> Response {
    let body = stream! {
        let mut events = AssertUnwindSafe(events).catch_unwind();
        let mut artifact_sent = false;
        let mut task_id = None;
        let mut total_steps = 0;
        let mut reason = "assessment ended without an artifact".to_string();

        while let Some(next) = events.next().await {
            match next {
                Ok(event) => {
                    if let AssessmentEvent::TaskUpdate(update) = &event {
                        total_steps = update.step;
                        if let Some(Value::String(id)) = update.metadata.get("task_id") {
                            task_id = Some(id.clone());
                        }
                    }
                    artifact_sent |= event.is_artifact();
                    yield Ok::<_, Infallible>(encode(&event));
                    if artifact_sent {
                        break;
                    }
                }
                Err(panic) => {
                    reason = panic_message(panic.as_ref());
                    tracing::error!(assessment_id = %assessment_id, %reason, "orchestrator panicked");
                    break;
                }
            }
        }

        if !artifact_sent {
            let mut report = ErrorReport::new(ErrorKind::Internal, reason);
            report.message = "Assessment ended unexpectedly".to_string();
            report.assessment_id = Some(assessment_id.clone());
            report.task_id = task_id;
            report.total_steps = total_steps;
            yield Ok(encode(&AssessmentEvent::Artifact(Artifact::error(report))));
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, NDJSON)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn encode(event: &AssessmentEvent) -> String {
    match serde_json::to_string(event) {
        Ok(mut line) => {
            line.push('\n');
            line
        }
        Err(error) => {
            tracing::error!(%error, "failed to serialize assessment event");
            let mut line = json!({
                "type": "artifact",
                "artifact_type": "evaluation_error",
                "done": true,
                "content": { "error": error.to_string(), "error_kind": "internal", "score": 0.0 },
            })
            .to_string();
            line.push('\n');
            line
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": SERVICE_NAME }))
}

#[derive(Debug, Serialize)]
pub struct AgentCard {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub capabilities: CardCapabilities,
    pub config_schema: Value,
    pub required_participants: Vec<&'static str>,
    pub produces_artifacts: bool,
    pub artifact_types: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CardCapabilities {
    pub protocol: &'static str,
    pub streaming: bool,
    pub evaluation: bool,
}

impl AgentCard {
    pub fn new(url: Option<String>) -> Self {
        Self {
            name: SERVICE_NAME,
            version: env!("CARGO_PKG_VERSION"),
            description: "Drives a remote agent through a tool-using task episode and scores the result.",
            capabilities: CardCapabilities {
                protocol: "a2a",
                streaming: true,
                evaluation: true,
            },
            config_schema: AssessmentConfig::json_schema(),
            required_participants: vec![EVALUATED_ROLE],
            produces_artifacts: true,
            artifact_types: vec!["evaluation_result", "evaluation_error"],
            url,
        }
    }
}

async fn card(State(state): State<Arc<AppState>>) -> Json<AgentCard> {
    Json(AgentCard::new(state.card_url.clone()))
}
