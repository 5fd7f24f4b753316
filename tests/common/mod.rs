//! Shared helpers for the HTTP integration tests

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use axum::{extract::State, routing::post, Json, Router};
use pruefwerk::{
    environment::{
        CapabilityRegistry, CapabilitySpec, StaticCapability, Task, TaskCatalog,
        TaskEnvironmentFactory,
    },
    server, AppState,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Binds `app` to an ephemeral local port and serves it in the background.
pub async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// State with one task and one static capability.
#[allow(dead_code)]
pub fn green_state() -> AppState {
    let catalog = TaskCatalog::new(vec![Task::new(
        "task1_1",
        "What's the MRN of the patient with name Peter Stafford?",
    )
    .with_expected_answer(vec![json!("S6534835")])
    .requiring("find_patient")]);
    let registry = CapabilityRegistry::new()
        .with_capability(Arc::new(StaticCapability::new(
            CapabilitySpec::new("find_patient", "Search patients by name"),
            r#"{"resourceType":"Bundle","entry":[{"resource":{"id":"S6534835"}}]}"#,
        )))
        .unwrap();
    AppState::new(Arc::new(TaskEnvironmentFactory::new(
        Arc::new(catalog),
        Arc::new(registry),
    )))
}

/// Starts the evaluator with `state`, returns its base URL.
#[allow(dead_code)]
pub async fn spawn_green(state: AppState) -> String {
    let addr = spawn(server::router(Arc::new(state))).await;
    format!("http://{addr}")
}

/// A participant answering `POST /message` with canned replies, oldest first.
/// Once the script runs out it keeps asking for a tool.
#[derive(Clone)]
#[allow(dead_code)]
pub struct PurpleAgent {
    replies: Arc<Mutex<VecDeque<Value>>>,
    calls: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl PurpleAgent {
    pub fn new(replies: impl IntoIterator<Item = Value>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into_iter().collect())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn spawn(&self) -> String {
        let app = Router::new()
            .route("/message", post(reply))
            .with_state(self.clone());
        format!("http://{}", spawn(app).await)
    }
}

async fn reply(State(agent): State<PurpleAgent>, Json(message): Json<Value>) -> Json<Value> {
    assert_eq!(message["role"], "green_agent");
    agent.calls.fetch_add(1, Ordering::SeqCst);
    let next = agent.replies.lock().unwrap().pop_front();
    Json(next.unwrap_or_else(|| {
        json!({ "action": { "action": "call_tool", "tool_name": "find_patient", "arguments": {} } })
    }))
}

#[allow(dead_code)]
pub fn call_tool(name: &str) -> Value {
    json!({ "action": { "action": "call_tool", "tool_name": name, "arguments": { "family": "Stafford" } } })
}

#[allow(dead_code)]
pub fn finish(summary: &str) -> Value {
    json!({ "action": { "action": "finish", "final_summary": summary } })
}

/// A local port with nothing listening on it.
#[allow(dead_code)]
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Splits an NDJSON body into parsed lines.
#[allow(dead_code)]
pub fn parse_lines(body: &str) -> Vec<Value> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("each line is one JSON object"))
        .collect()
}
