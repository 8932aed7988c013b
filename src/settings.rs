//! Runtime settings: JSON file, then `LEADERD_*` environment, then flags.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use election::ElectionConfig;
use serde::{Deserialize, Serialize};

use crate::cli::{Backend, Cli};

pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:2379";
pub const DEFAULT_DURATION_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_backend")]
    pub backend: Backend,

    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    #[serde(default)]
    pub election: ElectionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            endpoints: default_endpoints(),
            duration_secs: DEFAULT_DURATION_SECS,
            election: ElectionConfig::default(),
        }
    }
}

impl Settings {
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut settings = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(std::env::vars())?;
        settings.apply_cli(cli);
        settings.election.validate()?;
        if settings.endpoints.is_empty() {
            return Err(anyhow!("at least one endpoint is required"));
        }
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            match name.as_str() {
                "LEADERD_BACKEND" => {
                    self.backend = match value.to_ascii_lowercase().as_str() {
                        "etcd" => Backend::Etcd,
                        "memory" => Backend::Memory,
                        other => return Err(anyhow!("unknown backend {:?}", other)),
                    }
                }
                "LEADERD_ENDPOINTS" => {
                    self.endpoints = value
                        .split(',')
                        .map(str::trim)
                        .filter(|e| !e.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "LEADERD_ELECTION_KEY" => self.election.key = value,
                "LEADERD_LEASE_TTL_MS" => {
                    self.election.lease_ttl_ms = value
                        .parse()
                        .with_context(|| format!("LEADERD_LEASE_TTL_MS={}", value))?;
                }
                "LEADERD_DURATION_SECS" => {
                    self.duration_secs = value
                        .parse()
                        .with_context(|| format!("LEADERD_DURATION_SECS={}", value))?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(backend) = cli.backend {
            self.backend = backend;
        }
        if let Some(endpoints) = &cli.endpoints {
            self.endpoints = endpoints.clone();
        }
        if let Some(key) = &cli.key {
            self.election.key = key.clone();
        }
        if let Some(ttl) = cli.lease_ttl_ms {
            self.election.lease_ttl_ms = ttl;
        }
        if let Some(duration) = cli.duration_secs {
            self.duration_secs = duration;
        }
    }
}

/// etcd when it is compiled in, otherwise the in-process service.
fn default_backend() -> Backend {
    if cfg!(feature = "etcd") {
        Backend::Etcd
    } else {
        Backend::Memory
    }
}

fn default_endpoints() -> Vec<String> {
    vec![DEFAULT_ENDPOINT.to_string()]
}

fn default_duration_secs() -> u64 {
    DEFAULT_DURATION_SECS
}
