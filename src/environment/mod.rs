//! The domain environment the orchestrator drives.
//!
//! The orchestrator only sees the [`Environment`] trait. [`TaskEnvironment`] is
//! the bundled implementation: tasks from a [`TaskCatalog`], tools from a
//! [`CapabilityRegistry`], scoring via [`scoring`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{DomainStepError, EnvironmentError},
    protocol::AssessmentConfig,
};

pub mod capabilities;
pub mod http;
pub mod scoring;
pub mod task_env;
pub mod tasks;

pub use capabilities::{Capability, CapabilityRegistry, InvocationContext, StaticCapability};
pub use http::{load_http_capabilities, HttpCapability, HttpCapabilitySpec};
pub use task_env::TaskEnvironment;
pub use tasks::{Task, TaskCatalog};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl CapabilitySpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// A request to run one named capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    #[serde(rename = "tool_name")]
    pub capability: String,
    #[serde(default)]
    pub arguments: Value,
}

impl Invocation {
    pub fn new(capability: impl Into<String>, arguments: Value) -> Self {
        Self {
            capability: capability.into(),
            arguments,
        }
    }
}

/// What the participant is shown before each step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub task_id: String,
    pub task_description: String,
    pub step: u32,
    pub max_steps: u32,
    pub available_tools: Vec<CapabilitySpec>,
    pub last_tool_call: Option<Invocation>,
    pub last_tool_result_brief: Option<String>,
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct Reset {
    pub observation: Observation,
    pub step_budget: u32,
    pub task_id: String,
    pub subject_id: Option<String>,
}

pub type StepOutcome = Result<String, DomainStepError>;

#[derive(Debug, Clone)]
pub struct StepResult {
    pub observation: Observation,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEntry {
    Invocation {
        invocation: Invocation,
        result: String,
        failed: bool,
    },
    Finish {
        summary: String,
    },
}

/// Everything the participant did during one episode, in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_invocation(&mut self, invocation: Invocation, outcome: &StepOutcome) {
        let (result, failed) = match outcome {
            Ok(text) => (text.clone(), false),
            Err(error) => (error.to_string(), true),
        };
        self.entries.push(TraceEntry::Invocation {
            invocation,
            result,
            failed,
        });
    }

    pub fn record_finish(&mut self, summary: impl Into<String>) {
        self.entries.push(TraceEntry::Finish {
            summary: summary.into(),
        });
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn final_summary(&self) -> Option<&str> {
        self.entries.iter().rev().find_map(|entry| match entry {
            TraceEntry::Finish { summary } => Some(summary.as_str()),
            TraceEntry::Invocation { .. } => None,
        })
    }

    /// Whether `capability` ran at least once without failing.
    pub fn invoked_successfully(&self, capability: &str) -> bool {
        self.entries.iter().any(|entry| {
            matches!(
                entry,
                TraceEntry::Invocation { invocation, failed: false, .. }
                    if invocation.capability == capability
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub correct: bool,
    pub extracted_answer: Option<Value>,
    pub error: Option<String>,
    pub score: f64,
    pub summary: String,
}

#[async_trait]
pub trait Environment: Send + Sync {
    async fn reset(&mut self, config: &AssessmentConfig) -> Result<Reset, EnvironmentError>;

    /// Runs one capability. Bad invocations come back as a failed outcome, never as an error.
    async fn step(&mut self, invocation: &Invocation) -> StepResult;

    async fn evaluate(&self, trace: &Trace) -> Result<Evaluation, EnvironmentError>;

    /// Text sent to the participant for `observation`.
    fn render_observation(&self, observation: &Observation) -> Result<String, EnvironmentError> {
        Ok(serde_json::to_string_pretty(observation)?)
    }

    /// Re-renders `observation` with a note about the participant's last reply.
    fn render_with_note(
        &self,
        observation: &Observation,
        note: &str,
    ) -> Result<String, EnvironmentError> {
        Ok(format!("{}\n\n[Note]: {note}", self.render_observation(observation)?))
    }
}

/// Builds one fresh environment per assessment run.
pub trait EnvironmentFactory: Send + Sync {
    fn create(&self) -> Box<dyn Environment>;
}

impl<F> EnvironmentFactory for F
where
    F: Fn() -> Box<dyn Environment> + Send + Sync,
{
    fn create(&self) -> Box<dyn Environment> {
        self()
    }
}

/// Factory for [`TaskEnvironment`]s sharing one catalog and one capability registry.
#[derive(Clone)]
pub struct TaskEnvironmentFactory {
    catalog: Arc<TaskCatalog>,
    registry: Arc<CapabilityRegistry>,
}

impl TaskEnvironmentFactory {
    pub fn new(catalog: Arc<TaskCatalog>, registry: Arc<CapabilityRegistry>) -> Self {
        Self { catalog, registry }
    }
}

impl EnvironmentFactory for TaskEnvironmentFactory {
    fn create(&self) -> Box<dyn Environment> {
        Box::new(TaskEnvironment::new(
            Arc::clone(&self.catalog),
            Arc::clone(&self.registry),
        ))
    }
}
