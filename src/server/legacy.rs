//! Endpoints kept for older clients: a flat `/evaluate` body, and a
//! client-driven `/reset` + `/step` session loop where the caller relays
//! agent replies itself.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use crate::{
    environment::{Environment, Evaluation, Invocation, Observation, Trace},
    error::{EnvironmentError, SchemaError},
    protocol::{AssessmentConfig, AssessmentRequest, ParticipantAction, EVALUATED_ROLE},
    server::{reject, stream_assessment, ApiResponse, AppState},
};

/// Sessions idle for longer than this are dropped.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Open `/reset` sessions keyed by id. Idle entries expire after `ttl` and
/// are pruned whenever a new session is opened.
pub(crate) struct SessionStore<T = Session> {
    ttl: Duration,
    entries: Mutex<HashMap<String, SessionEntry<T>>>,
}

struct SessionEntry<T> {
    session: Arc<Mutex<T>>,
    last_used: Instant,
}

impl<T> SessionStore<T> {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    pub(crate) async fn insert(&self, id: String, session: T) {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.last_used.elapsed() < self.ttl);
        if entries.len() < before {
            tracing::info!(expired = before - entries.len(), "pruned idle legacy sessions");
        }
        entries.insert(
            id,
            SessionEntry {
                session: Arc::new(Mutex::new(session)),
                last_used: Instant::now(),
            },
        );
    }

    /// The live session for `id`, refreshing its idle clock.
    pub(crate) async fn get(&self, id: &str) -> Option<Arc<Mutex<T>>> {
        let mut entries = self.entries.lock().await;
        let expired = entries.get(id)?.last_used.elapsed() >= self.ttl;
        if expired {
            entries.remove(id);
            tracing::info!(session_id = %id, "legacy session expired");
            return None;
        }
        let entry = entries.get_mut(id)?;
        entry.last_used = Instant::now();
        Some(entry.session.clone())
    }

    pub(crate) async fn remove(&self, id: &str) {
        self.entries.lock().await.remove(id);
    }

    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

pub(crate) struct Session {
    environment: Box<dyn Environment>,
    observation: Observation,
    trace: Trace,
    step: u32,
    budget: u32,
    task_id: String,
    subject_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub purple_agent_url: String,
    #[serde(default, alias = "fhir_base_url")]
    pub backend_url: Option<String>,
    #[serde(default)]
    pub max_steps: Option<Value>,
    #[serde(default)]
    pub task_id: Option<String>,
}

impl From<EvaluateRequest> for AssessmentRequest {
    fn from(legacy: EvaluateRequest) -> Self {
        let mut request = AssessmentRequest::new(
            [(EVALUATED_ROLE.to_string(), legacy.purple_agent_url)]
                .into_iter()
                .collect(),
        );
        let entries = [
            ("backend_url", legacy.backend_url.map(Value::String)),
            ("max_steps", legacy.max_steps),
            ("task_id", legacy.task_id.map(Value::String)),
        ];
        for (key, value) in entries {
            if let Some(value) = value {
                request = request.with_config_value(key, value);
            }
        }
        request
    }
}

pub(crate) async fn evaluate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<EvaluateRequest>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(legacy)) => stream_assessment(&state, &AssessmentRequest::from(legacy)),
        Err(rejection) => reject(SchemaError::Malformed(rejection.body_text())),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default, alias = "fhir_base_url")]
    pub backend_url: Option<String>,
    #[serde(default)]
    pub max_steps: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub session_id: String,
    pub prompt: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct StepRequest {
    pub session_id: String,
    pub agent_response: String,
}

#[derive(Debug, Serialize)]
pub struct StepResponse {
    pub prompt: Option<String>,
    pub reward: f64,
    pub done: bool,
    pub info: Map<String, Value>,
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse {
            success: false,
            data: (),
            message: Some(message.into()),
        }),
    )
        .into_response()
}

fn environment_failure(error: EnvironmentError) -> Response {
    let status = match error {
        EnvironmentError::UnknownTask(_) | EnvironmentError::NoTasks => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(%error, "legacy session failed");
    failure(status, error.to_string())
}

pub(crate) async fn reset(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ResetRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(JsonRejection::MissingJsonContentType(_)) => ResetRequest::default(),
        Err(rejection) => return failure(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let mut config = Map::new();
    if let Some(task_id) = request.task_id {
        config.insert("task_id".into(), Value::String(task_id));
    }
    if let Some(backend_url) = request.backend_url {
        config.insert("backend_url".into(), Value::String(backend_url));
    }
    if let Some(max_steps) = request.max_steps {
        config.insert("max_steps".into(), max_steps);
    }
    let config = AssessmentConfig::from_map(&config).with_defaults(&state.defaults);

    let mut environment = state.environments.create();
    let reset = match environment.reset(&config).await {
        Ok(reset) => reset,
        Err(error) => return environment_failure(error),
    };
    let prompt = match environment.render_observation(&reset.observation) {
        Ok(prompt) => prompt,
        Err(error) => return environment_failure(error),
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(session_id = %session_id, task_id = %reset.task_id, "legacy session started");
    let session = Session {
        environment,
        observation: reset.observation,
        trace: Trace::new(),
        step: 0,
        budget: reset.step_budget,
        task_id: reset.task_id,
        subject_id: reset.subject_id,
    };
    state.sessions.insert(session_id.clone(), session).await;
    let open = state.sessions.len().await;
    tracing::debug!(open, "legacy sessions open");

    Json(ResetResponse {
        session_id,
        prompt,
        message: "Environment reset".to_string(),
    })
    .into_response()
}

pub(crate) async fn step(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StepRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return failure(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let Some(session) = state.sessions.get(&request.session_id).await else {
        return failure(
            StatusCode::NOT_FOUND,
            format!("unknown session: {}", request.session_id),
        );
    };
    let mut session = session.lock().await;

    let action = match ParticipantAction::parse(&request.agent_response) {
        Ok(action) => action,
        Err(error) => {
            let note = format!("could not parse your reply as an action: {error}");
            return match session.environment.render_with_note(&session.observation, &note) {
                Ok(prompt) => Json(StepResponse {
                    prompt: Some(prompt),
                    reward: 0.0,
                    done: false,
                    info: info([("error", Value::String(error))]),
                })
                .into_response(),
                Err(error) => environment_failure(error),
            };
        }
    };

    match action {
        ParticipantAction::CallTool { tool_name, arguments } => {
            let invocation = Invocation::new(tool_name, arguments);
            let result = session.environment.step(&invocation).await;
            session.step += 1;
            let mut details = match &result.outcome {
                Ok(text) => info([("tool_result", Value::String(text.clone()))]),
                Err(error) => info([("error", Value::String(error.to_string()))]),
            };
            session.trace.record_invocation(invocation, &result.outcome);
            session.observation = result.observation;

            if session.step >= session.budget {
                let evaluation = match session.environment.evaluate(&session.trace).await {
                    Ok(evaluation) => evaluation,
                    Err(error) => return environment_failure(error),
                };
                details.insert("reason".into(), "max_steps_reached".into());
                details.extend(outcome_info(&session, &evaluation));
                drop(session);
                state.sessions.remove(&request.session_id).await;
                tracing::info!(session_id = %request.session_id, "legacy session ran out of steps");
                return Json(StepResponse {
                    prompt: None,
                    reward: evaluation.score,
                    done: true,
                    info: details,
                })
                .into_response();
            }

            match session.environment.render_observation(&session.observation) {
                Ok(prompt) => Json(StepResponse {
                    prompt: Some(prompt),
                    reward: 0.0,
                    done: false,
                    info: details,
                })
                .into_response(),
                Err(error) => environment_failure(error),
            }
        }
        ParticipantAction::Finish { final_summary } => {
            session.step += 1;
            session.trace.record_finish(final_summary);
            let evaluation = match session.environment.evaluate(&session.trace).await {
                Ok(evaluation) => evaluation,
                Err(error) => return environment_failure(error),
            };
            let details = outcome_info(&session, &evaluation);
            drop(session);
            state.sessions.remove(&request.session_id).await;
            tracing::info!(
                session_id = %request.session_id,
                correct = evaluation.correct,
                "legacy session finished"
            );
            Json(StepResponse {
                prompt: None,
                reward: evaluation.score,
                done: true,
                info: details,
            })
            .into_response()
        }
    }
}

fn info<const N: usize>(entries: [(&str, Value); N]) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn outcome_info(session: &Session, evaluation: &Evaluation) -> Map<String, Value> {
    info([
        (
            "final_summary",
            session
                .trace
                .final_summary()
                .map_or(Value::Null, |summary| Value::String(summary.to_string())),
        ),
        (
            "evaluation",
            json!({
                "correct": evaluation.correct,
                "extracted_answer": evaluation.extracted_answer,
                "error": evaluation.error,
            }),
        ),
        ("task_id", Value::String(session.task_id.clone())),
        (
            "subject_id",
            session.subject_id.clone().map_or(Value::Null, Value::String),
        ),
        ("steps", Value::from(session.step)),
    ])
}
