//! # Agent configuration
//!
//! Settings for the transport client and the datagram command channel.
//!
//! Configuration is resolved in order of precedence:
//! 1. Command line flags (applied by the binaries)
//! 2. Environment variables (`C2EMU_*`)
//! 3. Configuration file (TOML)
//! 4. Built-in defaults
//!
//! ```toml
//! [agent]
//! id = "agent-1"
//! own_ip = "10.0.0.5"
//! download_dir = "/var/tmp/c2emu"
//! report_interval_secs = 10
//!
//! [controller]
//! host = "10.0.0.1"
//! port = 5000
//!
//! [dispatcher]
//! udp_port = 3003
//! activation_code = "S3CR3T"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_REPORT_QUEUE_CAPACITY: usize = 20;
pub const DEFAULT_C2_PORT: u16 = 5000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_UDP_PORT: u16 = 3003;
pub const DEFAULT_BUFFER_SIZE: usize = 60_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub controller: ControllerSection,
    pub dispatcher: DispatcherSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Unique identity announced to the controller.
    pub id: String,
    pub own_ip: String,
    pub download_dir: PathBuf,
    pub report_interval_secs: u64,
    pub task_queue_capacity: usize,
    pub report_queue_capacity: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: "c2emu-agent-0".to_string(),
            own_ip: "127.0.0.1".to_string(),
            download_dir: PathBuf::from("downloads"),
            report_interval_secs: DEFAULT_REPORT_INTERVAL_SECS,
            task_queue_capacity: DEFAULT_TASK_QUEUE_CAPACITY,
            report_queue_capacity: DEFAULT_REPORT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_C2_PORT,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ControllerSection {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub udp_port: u16,
    pub buffer_size: usize,
    /// Shared secret that activates the command channel. Has no default.
    pub activation_code: String,
    /// Directory receiving files pushed over the command channel.
    pub file_dir: PathBuf,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_UDP_PORT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            activation_code: String::new(),
            file_dir: PathBuf::from("."),
        }
    }
}

impl DispatcherSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.activation_code.is_empty() {
            return Err(ConfigError::Invalid(
                "dispatcher.activation_code must be set".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("dispatcher.buffer_size must be > 0".into()));
        }
        Ok(())
    }
}

impl AgentConfig {
    /// Defaults, then `path` if given, then `C2EMU_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    /// Unparsable numeric values are ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = text("C2EMU_AGENT_ID") {
            self.agent.id = v;
        }
        if let Some(v) = text("C2EMU_OWN_IP") {
            self.agent.own_ip = v;
        }
        if let Some(v) = text("C2EMU_DOWNLOAD_DIR") {
            self.agent.download_dir = PathBuf::from(v);
        }
        if let Some(v) = text("C2EMU_REPORT_INTERVAL").and_then(|v| v.trim().parse().ok()) {
            self.agent.report_interval_secs = v;
        }
        if let Some(v) = text("C2EMU_C2_HOST") {
            self.controller.host = v;
        }
        if let Some(v) = text("C2EMU_C2_PORT").and_then(|v| v.trim().parse().ok()) {
            self.controller.port = v;
        }
        if let Some(v) = text("C2EMU_UDP_PORT").and_then(|v| v.trim().parse().ok()) {
            self.dispatcher.udp_port = v;
        }
        if let Some(v) = text("C2EMU_ACT_CODE") {
            self.dispatcher.activation_code = v;
        }
        if let Some(v) = text("C2EMU_FILE_DIR") {
            self.dispatcher.file_dir = PathBuf::from(v);
        }
    }

    /// Checks the settings the transport client depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.id.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.id must not be empty".into()));
        }
        if self.agent.report_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "agent.report_interval_secs must be > 0".into(),
            ));
        }
        if self.agent.task_queue_capacity == 0 || self.agent.report_queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacities must be > 0".into()));
        }
        if self.controller.host.trim().is_empty() {
            return Err(ConfigError::Invalid("controller.host must not be empty".into()));
        }
        if self.controller.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "controller.request_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}
