use std::path::Path;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EnvironmentError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub subject_id: Option<String>,
    pub instruction: String,
    #[serde(default)]
    pub context: Option<String>,
    /// Reference answer, compared element-wise with the extracted answer.
    #[serde(default)]
    pub expected_answer: Option<Vec<Value>>,
    /// Capabilities that must have run successfully for the answer to count.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject_id: None,
            instruction: instruction.into(),
            context: None,
            expected_answer: None,
            required_capabilities: Vec::new(),
        }
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_expected_answer(mut self, answer: Vec<Value>) -> Self {
        self.expected_answer = Some(answer);
        self
    }

    pub fn requiring(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    /// Text shown to the participant as the task description.
    pub fn description(&self) -> String {
        let mut parts = Vec::with_capacity(3);
        if let Some(subject) = &self.subject_id {
            parts.push(format!("Patient MRN: {subject}"));
        }
        if let Some(context) = self.context.as_deref().filter(|c| !c.is_empty()) {
            parts.push(format!("Context: {context}"));
        }
        parts.push(format!("Task: {}", self.instruction));
        parts.join("\n")
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    tasks: Vec<Task>,
}

impl TaskCatalog {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    /// Reads a JSON or YAML list of tasks, chosen by file extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EnvironmentError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .map_or(false, |ext| ext == "yaml" || ext == "yml");

        let tasks: Vec<Task> = if is_yaml {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        tracing::info!(count = tasks.len(), path = %path.display(), "loaded task catalog");
        Ok(Self::new(tasks))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn sample(&self) -> Option<&Task> {
        self.tasks.choose(&mut rand::thread_rng())
    }

    /// The task named by `task_id`, or a random one when none is requested.
    pub fn select(&self, task_id: Option<&str>) -> Result<&Task, EnvironmentError> {
        match task_id {
            Some(id) => self
                .get(id)
                .ok_or_else(|| EnvironmentError::UnknownTask(id.to_string())),
            None => self.sample().ok_or(EnvironmentError::NoTasks),
        }
    }
}
