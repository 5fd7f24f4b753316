use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    environment::{
        capabilities::{Capability, DynCapability, InvocationContext},
        CapabilitySpec,
    },
    error::{DomainStepError, EnvironmentError},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Bearer,
    Header,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSpec {
    #[serde(rename = "type")]
    kind: AuthKind,
    #[serde(default)]
    env: Option<String>,
    #[serde(default)]
    header: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    ty: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    required: Option<bool>,
    #[serde(default)]
    #[serde(rename = "enum")]
    enum_values: Option<Vec<Value>>,
}

impl ParamSpec {
    fn to_schema(&self) -> Value {
        let mut schema = json!({ "type": self.ty });
        if let Some(description) = &self.description {
            schema["description"] = Value::String(description.clone());
        }
        if let Some(values) = self.enum_values.as_ref().filter(|values| !values.is_empty()) {
            schema["enum"] = Value::Array(values.clone());
        }
        schema
    }
}

/// YAML description of a backend call exposed as a capability.
///
/// `path` is appended to the run's `backend_url`; `url` overrides it with an
/// absolute address. `{name}` placeholders in the target and in `fixed_query`
/// values are filled from the arguments, `{subject_id}` from the active task.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpCapabilitySpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthSpec>,
    #[serde(default)]
    pub path_params: HashMap<String, ParamSpec>,
    #[serde(default)]
    pub query: HashMap<String, ParamSpec>,
    /// Constant query pairs; values may use placeholders.
    #[serde(default)]
    pub fixed_query: HashMap<String, String>,
    #[serde(default)]
    pub body: HashMap<String, ParamSpec>,
    /// Sends this argument as the entire JSON body instead of assembling one from `body`.
    #[serde(default)]
    pub body_from: Option<String>,
    /// Upper bound for one backend call; 0 or absent uses the default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

fn default_method() -> String {
    "GET".to_string()
}

impl HttpCapabilitySpec {
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map_or(DEFAULT_BACKEND_TIMEOUT, Duration::from_secs)
    }
}

/// Loads every `*.yaml` / `*.yml` capability spec in `dir`.
pub fn load_http_capabilities(dir: &Path) -> Result<Vec<DynCapability>, EnvironmentError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.extension()
                .map_or(false, |ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    paths.sort();

    let mut capabilities = Vec::with_capacity(paths.len());
    for path in paths {
        let content = std::fs::read_to_string(&path)?;
        let spec: HttpCapabilitySpec = serde_yaml::from_str(&content)?;
        tracing::debug!(capability = %spec.name, path = %path.display(), "loaded http capability");
        capabilities.push(Arc::new(HttpCapability::new(spec)?) as DynCapability);
    }
    Ok(capabilities)
}

#[derive(Clone)]
pub struct HttpCapability {
    definition: CapabilitySpec,
    spec: HttpCapabilitySpec,
    method: Method,
    client: reqwest::Client,
}

impl HttpCapability {
    pub fn new(spec: HttpCapabilitySpec) -> Result<Self, EnvironmentError> {
        if spec.path.is_none() && spec.url.is_none() {
            return Err(EnvironmentError::Misconfigured(format!(
                "http capability '{}' needs a path or a url",
                spec.name
            )));
        }
        let method = Method::from_bytes(spec.method.to_ascii_uppercase().as_bytes()).map_err(|error| {
            EnvironmentError::Misconfigured(format!("http capability '{}': {error}", spec.name))
        })?;
        let client = reqwest::Client::builder()
            .timeout(spec.timeout())
            .build()
            .map_err(|error| {
                EnvironmentError::Misconfigured(format!("http capability '{}': {error}", spec.name))
            })?;

        Ok(Self {
            definition: build_definition(&spec),
            spec,
            method,
            client,
        })
    }

    fn target(&self, context: &InvocationContext, args: &Map<String, Value>) -> Result<String, DomainStepError> {
        let template = match (&self.spec.url, &self.spec.path) {
            (Some(url), _) => url.clone(),
            (None, Some(path)) => {
                let base = context.backend_url.as_deref().ok_or_else(|| self.failure(
                    "no backend_url configured for this assessment",
                ))?;
                format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
            }
            (None, None) => return Err(self.failure("capability has no target")),
        };

        Ok(fill(&template, context, args))
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, DomainStepError> {
        let Some(auth) = &self.spec.auth else {
            return Ok(req);
        };
        match auth.kind {
            AuthKind::Bearer => {
                let env_key = auth
                    .env
                    .as_deref()
                    .ok_or_else(|| self.failure("bearer auth requires env key"))?;
                let token = env::var(env_key)
                    .map_err(|_| self.failure(format!("missing env var {env_key} for bearer auth")))?;
                Ok(req.bearer_auth(token))
            }
            AuthKind::Header => {
                let header = auth
                    .header
                    .as_deref()
                    .ok_or_else(|| self.failure("header auth requires header name"))?;
                let value = auth
                    .value
                    .as_deref()
                    .ok_or_else(|| self.failure("header auth requires value"))?;
                Ok(req.header(header, value))
            }
        }
    }

    fn failure(&self, message: impl Into<String>) -> DomainStepError {
        DomainStepError::Execution {
            capability: self.spec.name.clone(),
            message: message.into(),
        }
    }
}

fn build_definition(spec: &HttpCapabilitySpec) -> CapabilitySpec {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for (param, meta) in spec
        .path_params
        .iter()
        .chain(spec.query.iter())
        .chain(spec.body.iter())
    {
        properties.insert(param.clone(), meta.to_schema());
        if meta.required.unwrap_or(true) {
            required.push(Value::String(param.clone()));
        }
    }
    required.sort_by(|a, b| a.as_str().cmp(&b.as_str()));

    CapabilitySpec::new(
        spec.name.clone(),
        spec.description.clone().unwrap_or_default(),
    )
    .with_parameters(json!({
        "type": "object",
        "properties": properties,
        "required": required,
    }))
}

fn fill(template: &str, context: &InvocationContext, args: &Map<String, Value>) -> String {
    let mut filled = template.to_string();
    if let Some(subject) = &context.subject_id {
        filled = filled.replace("{subject_id}", subject);
    }
    for (key, value) in args {
        filled = filled.replace(&format!("{{{key}}}"), &scalar_to_string(value));
    }
    filled
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Capability for HttpCapability {
    fn spec(&self) -> CapabilitySpec {
        self.definition.clone()
    }

    async fn invoke(
        &self,
        context: &InvocationContext,
        arguments: &Value,
    ) -> Result<String, DomainStepError> {
        let empty = Map::new();
        let args = arguments.as_object().unwrap_or(&empty);

        let target = self.target(context, args)?;
        let mut request = self.client.request(self.method.clone(), &target);

        for (k, v) in &self.spec.headers {
            request = request.header(k, v);
        }
        request = self.apply_auth(request)?;

        let mut pairs: Vec<(&str, String)> = self
            .spec
            .fixed_query
            .iter()
            .map(|(key, value)| (key.as_str(), fill(value, context, args)))
            .collect();
        pairs.extend(
            self.spec
                .query
                .keys()
                .filter_map(|key| args.get(key).map(|value| (key.as_str(), scalar_to_string(value)))),
        );
        if !pairs.is_empty() {
            request = request.query(&pairs);
        }

        if let Some(key) = &self.spec.body_from {
            let body = args
                .get(key)
                .ok_or_else(|| self.failure(format!("missing argument '{key}' for the request body")))?;
            request = request.json(body);
        } else if !self.spec.body.is_empty() {
            let body: Map<String, Value> = self
                .spec
                .body
                .keys()
                .filter_map(|key| args.get(key).map(|value| (key.clone(), value.clone())))
                .collect();
            request = request.json(&Value::Object(body));
        }

        let response = request
            .send()
            .await
            .map_err(|error| self.failure(format!("backend request failed: {error}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| self.failure(format!("failed to read backend response: {error}")))?;

        if !status.is_success() {
            return Err(self.failure(format!("backend responded with {status}: {text}")));
        }

        // Prefer compact JSON so results survive truncation in the observation.
        match serde_json::from_str::<Value>(&text) {
            Ok(json) => Ok(json.to_string()),
            Err(_) => Ok(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::{
        extract::{Path as AxumPath, Query},
        routing::get,
        Json, Router,
    };

    use super::*;

    const LABS_SPEC: &str = r#"
name: get_recent_labs
description: Recent laboratory results for one lab code.
method: get
path: /Patient/{patient_id}/labs
path_params:
  patient_id:
    type: string
query:
  lab_code:
    type: string
    description: Lab code such as MG or GLU
  limit:
    type: integer
    required: false
"#;

    async fn spawn(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    #[test]
    fn builds_parameter_schema_from_spec() {
        let spec: HttpCapabilitySpec = serde_yaml::from_str(LABS_SPEC).unwrap();
        let capability = HttpCapability::new(spec).unwrap();
        let definition = capability.spec();
        let parameters = definition.parameters.expect("parameters");

        assert_eq!(definition.name, "get_recent_labs");
        assert_eq!(parameters["properties"]["lab_code"]["description"], "Lab code such as MG or GLU");
        assert_eq!(parameters["required"], json!(["lab_code", "patient_id"]));
    }

    #[test]
    fn spec_without_target_is_rejected() {
        let spec: HttpCapabilitySpec = serde_yaml::from_str("name: nowhere\n").unwrap();
        assert!(matches!(HttpCapability::new(spec), Err(EnvironmentError::Misconfigured(_))));
    }

    #[tokio::test]
    async fn calls_backend_relative_to_configured_url() {
        let app = Router::new().route(
            "/fhir/Patient/{id}/labs",
            get(
                |AxumPath(id): AxumPath<String>, Query(query): Query<HashMap<String, String>>| async move {
                    Json(json!({ "patient": id, "code": query.get("lab_code"), "value": 2.1 }))
                },
            ),
        );
        let addr = spawn(app).await;

        let spec: HttpCapabilitySpec = serde_yaml::from_str(LABS_SPEC).unwrap();
        let capability = HttpCapability::new(spec).unwrap();
        let context = InvocationContext {
            backend_url: Some(format!("http://{addr}/fhir/")),
            subject_id: None,
        };

        let text = capability
            .invoke(&context, &json!({ "patient_id": "S6541353", "lab_code": "MG" }))
            .await
            .expect("invoke");
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["patient"], "S6541353");
        assert_eq!(parsed["code"], "MG");
    }

    #[tokio::test]
    async fn fixed_query_and_raw_body_are_sent() {
        let app = Router::new().route(
            "/fhir/{resource}",
            axum::routing::post(
                |AxumPath(resource): AxumPath<String>,
                 Query(query): Query<HashMap<String, String>>,
                 Json(body): Json<Value>| async move {
                    Json(json!({ "resource": resource, "subject": query.get("subject"), "body": body }))
                },
            ),
        );
        let addr = spawn(app).await;

        let spec: HttpCapabilitySpec = serde_yaml::from_str(
            r#"
name: post_fhir_resource
method: POST
path: /{resource_type}
fixed_query:
  subject: Patient/{subject_id}
path_params:
  resource_type:
    type: string
body:
  payload:
    type: object
body_from: payload
"#,
        )
        .unwrap();
        let capability = HttpCapability::new(spec).unwrap();
        let context = InvocationContext {
            backend_url: Some(format!("http://{addr}/fhir")),
            subject_id: Some("S6315806".into()),
        };

        let text = capability
            .invoke(
                &context,
                &json!({ "resource_type": "MedicationRequest", "payload": { "status": "active" } }),
            )
            .await
            .expect("invoke");
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["resource"], "MedicationRequest");
        assert_eq!(parsed["subject"], "Patient/S6315806");
        assert_eq!(parsed["body"], json!({ "status": "active" }));
    }

    #[tokio::test]
    async fn hung_backend_is_cut_off() {
        let app = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                "too late"
            }),
        );
        let addr = spawn(app).await;

        let spec: HttpCapabilitySpec = serde_yaml::from_str(&format!(
            "name: slow\nurl: http://{addr}/slow\ntimeout_secs: 1\n"
        ))
        .unwrap();
        assert_eq!(spec.timeout(), Duration::from_secs(1));
        let capability = HttpCapability::new(spec).unwrap();

        let started = std::time::Instant::now();
        let error = capability
            .invoke(&InvocationContext::default(), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(error, DomainStepError::Execution { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn backend_timeout_defaults() {
        let spec: HttpCapabilitySpec =
            serde_yaml::from_str("name: a\npath: /a\ntimeout_secs: 0\n").unwrap();
        assert_eq!(spec.timeout(), DEFAULT_BACKEND_TIMEOUT);
        let spec: HttpCapabilitySpec = serde_yaml::from_str("name: a\npath: /a\n").unwrap();
        assert_eq!(spec.timeout(), DEFAULT_BACKEND_TIMEOUT);
    }

    #[tokio::test]
    async fn missing_backend_is_an_execution_failure() {
        let spec: HttpCapabilitySpec = serde_yaml::from_str(LABS_SPEC).unwrap();
        let capability = HttpCapability::new(spec).unwrap();
        let error = capability
            .invoke(&InvocationContext::default(), &json!({ "patient_id": "S1", "lab_code": "MG" }))
            .await
            .unwrap_err();
        assert!(matches!(error, DomainStepError::Execution { .. }));
    }
}
