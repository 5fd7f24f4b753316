use std::sync::Arc;

use async_trait::async_trait;
use handlebars::Handlebars;
use serde_json::json;

use crate::{
    environment::{
        capabilities::{CapabilityRegistry, InvocationContext},
        scoring,
        tasks::{Task, TaskCatalog},
        Environment, Evaluation, Invocation, Observation, Reset, StepResult, Trace,
    },
    error::{DomainStepError, EnvironmentError},
    protocol::AssessmentConfig,
};

const RESULT_BRIEF_LIMIT: usize = 500;

const PROMPT_TEMPLATE: &str = r#"You are being evaluated inside a clinical task environment.
Each turn you receive the current observation and must answer with exactly one JSON object:

1) Call a tool: {"action": "call_tool", "tool_name": "<tool name>", "arguments": { ... }}
2) Finish the task: {"action": "finish", "final_summary": "<final answer, e.g. [\"S1234567\"]>"}

Do not output anything besides that JSON object.
{{#if note}}

[Note]: {{note}}
{{/if}}

[Observation (JSON)]:
{{{observation}}}
"#;

struct ActiveTask {
    task: Task,
    context: InvocationContext,
    step: u32,
    max_steps: u32,
    last_call: Option<Invocation>,
    last_result: Option<String>,
}

/// Task-driven environment over a shared catalog and capability registry.
pub struct TaskEnvironment {
    catalog: Arc<TaskCatalog>,
    registry: Arc<CapabilityRegistry>,
    templates: Handlebars<'static>,
    active: Option<ActiveTask>,
}

impl TaskEnvironment {
    pub fn new(catalog: Arc<TaskCatalog>, registry: Arc<CapabilityRegistry>) -> Self {
        let mut templates = Handlebars::new();
        templates.set_strict_mode(false);
        Self {
            catalog,
            registry,
            templates,
            active: None,
        }
    }

    fn render(&self, observation: &Observation, note: Option<&str>) -> Result<String, EnvironmentError> {
        let data = json!({
            "observation": serde_json::to_string_pretty(observation)?,
            "note": note,
        });
        Ok(self.templates.render_template(PROMPT_TEMPLATE, &data)?)
    }
}

fn observe(registry: &CapabilityRegistry, active: &ActiveTask) -> Observation {
    Observation {
        task_id: active.task.id.clone(),
        task_description: active.task.description(),
        step: active.step,
        max_steps: active.max_steps,
        available_tools: registry.specs(),
        last_tool_call: active.last_call.clone(),
        last_tool_result_brief: active.last_result.clone(),
        done: active.step >= active.max_steps,
    }
}

fn brief(text: &str) -> String {
    if text.chars().count() <= RESULT_BRIEF_LIMIT {
        return text.to_string();
    }
    text.chars().take(RESULT_BRIEF_LIMIT).collect()
}

#[async_trait]
impl Environment for TaskEnvironment {
    async fn reset(&mut self, config: &AssessmentConfig) -> Result<Reset, EnvironmentError> {
        let task = self.catalog.select(config.task_id.as_deref())?.clone();
        let max_steps = config.max_steps();

        let active = ActiveTask {
            context: InvocationContext {
                backend_url: config.backend_url.clone(),
                subject_id: task.subject_id.clone(),
            },
            task,
            step: 0,
            max_steps,
            last_call: None,
            last_result: None,
        };
        let observation = observe(&self.registry, &active);
        let reset = Reset {
            observation,
            step_budget: max_steps,
            task_id: active.task.id.clone(),
            subject_id: active.task.subject_id.clone(),
        };
        tracing::debug!(task_id = %reset.task_id, max_steps, "environment reset");
        self.active = Some(active);
        Ok(reset)
    }

    async fn step(&mut self, invocation: &Invocation) -> StepResult {
        let registry = Arc::clone(&self.registry);
        let context = self
            .active
            .as_ref()
            .map(|active| active.context.clone())
            .unwrap_or_default();

        let outcome = if self.active.is_some() {
            registry.invoke(&context, invocation).await
        } else {
            Err(DomainStepError::Execution {
                capability: invocation.capability.clone(),
                message: "no active episode".to_string(),
            })
        };

        let observation = match self.active.as_mut() {
            Some(active) => {
                active.step += 1;
                active.last_call = Some(invocation.clone());
                active.last_result = Some(match &outcome {
                    Ok(text) => brief(text),
                    Err(error) => format!("Error: {error}"),
                });
                observe(&self.registry, active)
            }
            None => Observation {
                task_id: String::new(),
                task_description: String::new(),
                step: 0,
                max_steps: 0,
                available_tools: self.registry.specs(),
                last_tool_call: Some(invocation.clone()),
                last_tool_result_brief: None,
                done: true,
            },
        };

        StepResult {
            observation,
            outcome: outcome.map(|text| brief(&text)),
        }
    }

    async fn evaluate(&self, trace: &Trace) -> Result<Evaluation, EnvironmentError> {
        let active = self.active.as_ref().ok_or(EnvironmentError::NotStarted)?;
        Ok(scoring::evaluate(&active.task, trace))
    }

    fn render_observation(&self, observation: &Observation) -> Result<String, EnvironmentError> {
        self.render(observation, None)
    }

    fn render_with_note(
        &self,
        observation: &Observation,
        note: &str,
    ) -> Result<String, EnvironmentError> {
        self.render(observation, Some(note))
    }
}
