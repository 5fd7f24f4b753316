use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;

use crate::{
    environment::{load_http_capabilities, CapabilityRegistry, TaskCatalog, TaskEnvironmentFactory},
    error::EnvironmentError,
    protocol::{RunDefaults, DEFAULT_MAX_STEPS},
    server::AppState,
};

#[derive(Debug, Clone, Parser)]
#[command(name = "pruefwerk-server")]
#[command(about = "Serve streaming agent assessments over HTTP")]
pub struct ServerConfig {
    /// Address to bind
    #[arg(long, env = "PRUEFWERK_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PRUEFWERK_PORT", default_value_t = 9009)]
    pub port: u16,

    /// Task catalog (YAML or JSON)
    #[arg(long, env = "PRUEFWERK_TASKS", default_value = "data/tasks.yaml")]
    pub tasks: PathBuf,

    /// Directory of HTTP capability specs (YAML)
    #[arg(long, env = "PRUEFWERK_CAPABILITIES_DIR", default_value = "data/capabilities")]
    pub capabilities_dir: PathBuf,

    /// Step budget for requests that do not set `max_steps`
    #[arg(long, env = "PRUEFWERK_MAX_STEPS", default_value_t = DEFAULT_MAX_STEPS)]
    pub max_steps: u32,

    /// Per-step participant timeout for requests that do not set `timeout_secs`
    #[arg(long, env = "PRUEFWERK_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Idle lifetime of a legacy `/reset` session
    #[arg(long, env = "PRUEFWERK_SESSION_TTL_SECS", default_value_t = 1800)]
    pub session_ttl_secs: u64,

    /// Public URL advertised on the card
    #[arg(long, env = "PRUEFWERK_CARD_URL")]
    pub card_url: Option<String>,
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn defaults(&self) -> RunDefaults {
        RunDefaults {
            max_steps: self.max_steps,
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
        }
    }

    /// Loads tasks and capabilities and assembles the shared server state.
    pub fn build_state(&self) -> Result<AppState, EnvironmentError> {
        let catalog = TaskCatalog::from_path(&self.tasks)?;
        if catalog.is_empty() {
            tracing::warn!(path = %self.tasks.display(), "task catalog is empty");
        }

        let mut registry = CapabilityRegistry::new();
        if self.capabilities_dir.is_dir() {
            registry.register_all(load_http_capabilities(&self.capabilities_dir)?)?;
        } else {
            tracing::warn!(
                path = %self.capabilities_dir.display(),
                "capabilities directory not found, no tools will be offered"
            );
        }
        tracing::info!(
            tasks = catalog.len(),
            capabilities = registry.len(),
            "environment ready"
        );

        let factory = TaskEnvironmentFactory::new(Arc::new(catalog), Arc::new(registry));
        let mut state = AppState::new(Arc::new(factory))
            .with_defaults(self.defaults())
            .with_session_ttl(Duration::from_secs(self.session_ttl_secs));
        if let Some(url) = &self.card_url {
            state = state.with_card_url(url.clone());
        }
        Ok(state)
    }
}
