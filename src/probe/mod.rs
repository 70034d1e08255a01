//! Probe module for health checks.
//!
//! Supports HTTP and TCP probes, plus externally registered kinds.

mod http;
mod tcp;

pub use http::*;
pub use tcp::*;

use crate::db::Check;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error text recorded when a probe overruns its time limit.
pub const SOFT_TIME_LIMIT_ERROR: &str = "Error in performing check: soft time limit exceeded";
pub const TIMEOUT_TAG: &str = "probe_timeout";
pub const RUN_ERROR_TAG: &str = "run_error";

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unsupported probe kind: {0}")]
    Unsupported(String),
}

/// What a probe observed. A failed check is an outcome, not an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeOutcome {
    pub succeeded: bool,
    pub error: Option<String>,
    pub tags: Vec<String>,
    pub raw_data: Option<String>,
}

impl ProbeOutcome {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            succeeded: false,
            error: Some(error.into()),
            tags,
            raw_data: None,
        }
    }

    pub fn with_raw_data(mut self, raw_data: impl Into<String>) -> Self {
        self.raw_data = Some(raw_data.into());
        self
    }
}

/// Probe configuration stored with each check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeSpec {
    Http(HttpProbeConfig),
    Tcp(TcpProbeConfig),
    /// A kind implemented outside this crate, looked up by name at run time.
    External {
        kind: String,
        #[serde(default)]
        config: serde_json::Value,
    },
}

impl Default for ProbeSpec {
    fn default() -> Self {
        ProbeSpec::Http(HttpProbeConfig::default())
    }
}

impl ProbeSpec {
    pub fn http(endpoint: &str) -> Self {
        ProbeSpec::Http(HttpProbeConfig {
            endpoint: endpoint.to_string(),
            ..Default::default()
        })
    }

    pub fn tcp(address: &str, port: u16) -> Self {
        ProbeSpec::Tcp(TcpProbeConfig {
            address: address.to_string(),
            port,
            ..Default::default()
        })
    }

    pub fn kind(&self) -> &str {
        match self {
            ProbeSpec::Http(_) => "http",
            ProbeSpec::Tcp(_) => "tcp",
            ProbeSpec::External { kind, .. } => kind,
        }
    }

    /// Reject configurations that could never run correctly.
    pub fn validate(&self) -> Result<(), ProbeError> {
        match self {
            ProbeSpec::Http(config) => config.validate(),
            ProbeSpec::Tcp(config) => config.validate(),
            ProbeSpec::External { kind, .. } if kind.trim().is_empty() => {
                Err(ProbeError::Config("external probe kind must not be empty".to_string()))
            }
            ProbeSpec::External { .. } => Ok(()),
        }
    }
}

/// Something that can run a check and report what it saw.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn execute(&self, check: &Check) -> Result<ProbeOutcome, ProbeError>;
}

/// Runs built-in probes and dispatches external kinds to registered probes.
pub struct ProbeRunner {
    external: HashMap<String, Arc<dyn Probe>>,
    max_jitter_ms: u64,
}

impl Default for ProbeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeRunner {
    pub fn new() -> Self {
        Self {
            external: HashMap::new(),
            max_jitter_ms: 100,
        }
    }

    /// Maximum random delay before each probe. Zero disables it.
    pub fn with_jitter(mut self, max_jitter_ms: u64) -> Self {
        self.max_jitter_ms = max_jitter_ms;
        self
    }

    /// Register a probe for an external kind.
    pub fn register(&mut self, kind: impl Into<String>, probe: Arc<dyn Probe>) {
        let kind = kind.into();
        tracing::info!("Registered probe kind: {}", kind);
        self.external.insert(kind, probe);
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = vec!["http", "tcp"];
        kinds.extend(self.external.keys().map(|k| k.as_str()));
        kinds
    }
}

#[async_trait]
impl Probe for ProbeRunner {
    async fn execute(&self, check: &Check) -> Result<ProbeOutcome, ProbeError> {
        // Add jitter to avoid thundering herd
        if self.max_jitter_ms > 0 {
            let jitter = rand::random::<u64>() % self.max_jitter_ms;
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        match &check.probe {
            ProbeSpec::Http(config) => run_http_probe(config).await,
            ProbeSpec::Tcp(config) => run_tcp_probe(config).await,
            ProbeSpec::External { kind, .. } => match self.external.get(kind) {
                Some(probe) => probe.execute(check).await,
                None => Err(ProbeError::Unsupported(kind.clone())),
            },
        }
    }
}

/// Run a probe bounded by `timeout`, turning every error into a failed outcome.
pub async fn execute_with_timeout(probe: &dyn Probe, check: &Check, timeout: Duration) -> ProbeOutcome {
    match tokio::time::timeout(timeout, probe.execute(check)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(ProbeError::Timeout(_))) | Err(_) => {
            tracing::warn!("Probe for {} exceeded its time limit", check.name);
            ProbeOutcome::failure(SOFT_TIME_LIMIT_ERROR, vec![TIMEOUT_TAG.to_string()])
        }
        Ok(Err(e)) => {
            tracing::error!("Probe failed for {}: {}", check.name, e);
            ProbeOutcome::failure(
                format!("Error in performing check: {}", e),
                vec![RUN_ERROR_TAG.to_string()],
            )
        }
    }
}
