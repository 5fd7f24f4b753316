use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::{
    environment::{CapabilitySpec, Invocation},
    error::{DomainStepError, EnvironmentError},
};

const MAX_SUGGESTION_DISTANCE: usize = 3;

/// Per-run values a capability may need, taken from the assessment config and task.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    pub backend_url: Option<String>,
    pub subject_id: Option<String>,
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn spec(&self) -> CapabilitySpec;

    async fn invoke(
        &self,
        context: &InvocationContext,
        arguments: &Value,
    ) -> Result<String, DomainStepError>;
}

pub type DynCapability = Arc<dyn Capability>;

#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, DynCapability>,
    validators: HashMap<String, JSONSchema>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: DynCapability) -> Result<(), EnvironmentError> {
        let spec = capability.spec();
        if let Some(schema) = &spec.parameters {
            let compiled = JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(schema)
                .map_err(|error| {
                    EnvironmentError::Misconfigured(format!(
                        "invalid parameter schema for '{}': {error}",
                        spec.name
                    ))
                })?;
            self.validators.insert(spec.name.clone(), compiled);
        } else {
            self.validators.remove(&spec.name);
        }
        self.capabilities.insert(spec.name, capability);
        Ok(())
    }

    pub fn register_all<I>(&mut self, capabilities: I) -> Result<(), EnvironmentError>
    where
        I: IntoIterator<Item = DynCapability>,
    {
        for capability in capabilities {
            self.register(capability)?;
        }
        Ok(())
    }

    pub fn with_capability(mut self, capability: DynCapability) -> Result<Self, EnvironmentError> {
        self.register(capability)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&DynCapability> {
        self.capabilities.get(name)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn specs(&self) -> Vec<CapabilitySpec> {
        self.capabilities
            .values()
            .map(|capability| capability.spec())
            .collect()
    }

    pub async fn invoke(
        &self,
        context: &InvocationContext,
        invocation: &Invocation,
    ) -> Result<String, DomainStepError> {
        let name = invocation.capability.as_str();
        let capability = self
            .get(name)
            .ok_or_else(|| DomainStepError::UnknownCapability {
                name: name.to_string(),
                suggestion: self.closest(name),
            })?;

        let arguments = match &invocation.arguments {
            Value::Null => Value::Object(Default::default()),
            Value::Object(_) => invocation.arguments.clone(),
            other => {
                return Err(DomainStepError::InvalidArguments {
                    capability: name.to_string(),
                    reason: format!("arguments must be a JSON object, got {other}"),
                })
            }
        };

        if let Some(validator) = self.validators.get(name) {
            if let Err(errors) = validator.validate(&arguments) {
                let reason = errors
                    .take(5)
                    .map(|error| error.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(DomainStepError::InvalidArguments {
                    capability: name.to_string(),
                    reason,
                });
            }
        }

        capability.invoke(context, &arguments).await
    }

    fn closest(&self, want: &str) -> Option<String> {
        let want = want.trim().to_ascii_lowercase();
        self.capabilities
            .keys()
            .map(|name| (name, strsim::levenshtein(&want, &name.to_ascii_lowercase())))
            .min_by_key(|(_, distance)| *distance)
            .filter(|(_, distance)| *distance <= MAX_SUGGESTION_DISTANCE)
            .map(|(name, _)| name.clone())
    }
}

/// A capability that always answers with the same text.
pub struct StaticCapability {
    spec: CapabilitySpec,
    response: String,
}

impl StaticCapability {
    pub fn new(spec: CapabilitySpec, response: impl Into<String>) -> Self {
        Self {
            spec,
            response: response.into(),
        }
    }
}

#[async_trait]
impl Capability for StaticCapability {
    fn spec(&self) -> CapabilitySpec {
        self.spec.clone()
    }

    async fn invoke(
        &self,
        _context: &InvocationContext,
        _arguments: &Value,
    ) -> Result<String, DomainStepError> {
        Ok(self.response.clone())
    }
}
