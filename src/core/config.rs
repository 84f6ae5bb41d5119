//! Immutable explorer configuration.
//!
//! Loaded once (JSON file, then environment overrides) and shared as
//! `Arc<ExplorerConfig>`. Nothing in the library reads process-wide state.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::job::FlowType;
use crate::scatter::CoordinateCoercion;

fn default_user() -> String {
    "mlexchange_team".to_string()
}

fn default_max_time() -> String {
    "1:00:00".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:8071".to_string()
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

fn default_queue_capacity() -> usize {
    32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplorerConfig {
    /// Identity used as the first segment of every results key.
    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub results_tiled_uri: String,
    #[serde(default)]
    pub results_tiled_api_key: String,

    /// Root under which per-user results and models are written by jobs.
    #[serde(default)]
    pub write_dir: String,
    #[serde(default)]
    pub read_dir_mount: Option<String>,
    #[serde(default)]
    pub docker_network: String,

    #[serde(default)]
    pub flow_type: FlowType,
    #[serde(default)]
    pub partitions_cpu: Vec<String>,
    #[serde(default)]
    pub reservations_cpu: Vec<String>,
    #[serde(default = "default_max_time")]
    pub max_time_cpu: String,
    #[serde(default)]
    pub submission_ssh_key: String,
    #[serde(default)]
    pub forward_ports: Vec<String>,

    #[serde(default)]
    pub coordinate_coercion: CoordinateCoercion,

    // Daemon settings.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Directory served by the filesystem results store.
    #[serde(default)]
    pub results_dir: Option<String>,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub live_queue_capacity: usize,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            results_tiled_uri: String::new(),
            results_tiled_api_key: String::new(),
            write_dir: String::new(),
            read_dir_mount: None,
            docker_network: String::new(),
            flow_type: FlowType::default(),
            partitions_cpu: Vec::new(),
            reservations_cpu: Vec::new(),
            max_time_cpu: default_max_time(),
            submission_ssh_key: String::new(),
            forward_ports: Vec::new(),
            coordinate_coercion: CoordinateCoercion::default(),
            listen_addr: default_listen_addr(),
            results_dir: None,
            fetch_timeout_ms: default_fetch_timeout_ms(),
            live_queue_capacity: default_queue_capacity(),
        }
    }
}

impl ExplorerConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Read a JSON config file; a missing file yields the defaults.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Apply overrides from the process environment.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup (the process environment in
    /// production, a map in tests).
    pub fn with_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // LIVE_USER wins over the login name.
        if let Some(v) = lookup("LIVE_USER").or_else(|| lookup("USER")) {
            self.user = v;
        }
        if let Some(v) = lookup("RESULTS_TILED_URI") {
            self.results_tiled_uri = v;
        }
        if let Some(v) = lookup("RESULTS_TILED_API_KEY") {
            self.results_tiled_api_key = v;
        }
        if let Some(v) = lookup("WRITE_DIR") {
            self.write_dir = v;
        }
        if let Some(v) = lookup("READ_DIR_MOUNT") {
            self.read_dir_mount = Some(v);
        }
        if let Some(v) = lookup("DOCKER_NETWORK") {
            self.docker_network = v;
        }
        if let Some(v) = lookup("FLOW_TYPE") {
            self.flow_type = FlowType::parse(&v).ok_or_else(|| ConfigError::Env {
                var: "FLOW_TYPE",
                reason: format!("unknown flow type '{v}' (expected podman|docker|conda|slurm)"),
            })?;
        }
        if let Some(v) = lookup("PARTITIONS_CPU") {
            self.partitions_cpu = json_list("PARTITIONS_CPU", &v)?;
        }
        if let Some(v) = lookup("RESERVATIONS_CPU") {
            self.reservations_cpu = json_list("RESERVATIONS_CPU", &v)?;
        }
        if let Some(v) = lookup("MAX_TIME_CPU") {
            self.max_time_cpu = v;
        }
        if let Some(v) = lookup("SUBMISSION_SSH_KEY") {
            self.submission_ssh_key = v;
        }
        if let Some(v) = lookup("FORWARD_PORTS") {
            self.forward_ports = json_list("FORWARD_PORTS", &v)?;
        }
        if let Some(v) = lookup("LATENTD_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = lookup("LATENTD_RESULTS_DIR") {
            self.results_dir = Some(v);
        }
        if let Some(v) = lookup("LATENTD_FETCH_TIMEOUT_MS") {
            self.fetch_timeout_ms = v.trim().parse().map_err(|e| ConfigError::Env {
                var: "LATENTD_FETCH_TIMEOUT_MS",
                reason: format!("{e}"),
            })?;
        }
        if let Some(v) = lookup("LATENTD_QUEUE_CAPACITY") {
            self.live_queue_capacity = v.trim().parse().map_err(|e| ConfigError::Env {
                var: "LATENTD_QUEUE_CAPACITY",
                reason: format!("{e}"),
            })?;
        }
        Ok(self)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms.max(1))
    }

    /// Queue capacity, never below one slot.
    pub fn queue_capacity(&self) -> usize {
        self.live_queue_capacity.max(1)
    }
}

/// Upstream deployments pass list settings as JSON arrays; entries may be
/// strings or numbers (forwarded ports usually are numbers).
fn json_list(var: &'static str, raw: &str) -> Result<Vec<String>, ConfigError> {
    let values: Vec<serde_json::Value> =
        serde_json::from_str(raw).map_err(|e| ConfigError::Env {
            var,
            reason: format!("expected a JSON list: {e}"),
        })?;
    Ok(values
        .into_iter()
        .map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .collect())
}
