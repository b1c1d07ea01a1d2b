//! Agent configuration
//!
//! One YAML document describes every agent the process runs. It is loaded and
//! validated once at startup and then handed to each agent as an immutable
//! value.

pub mod target;

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use target::{CertificateTarget, CrlConfig};

/// Location used when neither `--config` nor `WARDEN_CONFIG` is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/warden/agent.yaml";

/// Environment variable consulted when no bootstrap token is configured
pub const BOOTSTRAP_TOKEN_ENV: &str = "WARDEN_BOOTSTRAP_TOKEN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: Option<ServerAgentConfig>,
    #[serde(default)]
    pub client: Option<ClientAgentConfig>,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server certificate agent (ACME)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerAgentConfig {
    pub domain_name: String,
    #[serde(flatten)]
    pub target: CertificateTarget,
    pub acme: AcmeConfig,
    #[serde(default)]
    pub reload: Option<ReloadConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AcmeConfig {
    /// Webroot served by the managed web server; HTTP-01 tokens go under
    /// `.well-known/acme-challenge/`
    pub challenge_dir: PathBuf,
    /// Persisted account credentials, reused across runs
    #[serde(default)]
    pub account_path: Option<PathBuf>,
    #[serde(default)]
    pub contact: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReloadConfig {
    /// Container or service name substituted for `{target}`
    pub target: String,
    #[serde(default = "default_reload_command")]
    pub command: Vec<String>,
    #[serde(default = "default_reload_timeout")]
    pub timeout_seconds: u64,
}

/// Client certificate agent (EST)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClientAgentConfig {
    pub device_name: String,
    pub subject_dn: String,
    #[serde(flatten)]
    pub target: CertificateTarget,
    #[serde(default)]
    pub est: EstConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EstConfig {
    #[serde(default)]
    pub bootstrap_token: Option<String>,
    /// Trust anchors for the EST server, PEM bundle
    #[serde(default)]
    pub ca_bundle_path: Option<PathBuf>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for EstConfig {
    fn default() -> Self {
        Self {
            bootstrap_token: None,
            ca_bundle_path: None,
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl EstConfig {
    /// Configured bootstrap token, falling back to `WARDEN_BOOTSTRAP_TOKEN`
    pub fn bootstrap_token(&self) -> Option<String> {
        self.bootstrap_token
            .clone()
            .filter(|token| !token.trim().is_empty())
            .or_else(|| std::env::var(BOOTSTRAP_TOKEN_ENV).ok())
            .filter(|token| !token.trim().is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct HealthConfig {
    /// Health endpoint is disabled when absent
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

impl AsRef<CertificateTarget> for ServerAgentConfig {
    fn as_ref(&self) -> &CertificateTarget {
        &self.target
    }
}

impl AsRef<CertificateTarget> for ClientAgentConfig {
    fn as_ref(&self) -> &CertificateTarget {
        &self.target
    }
}

impl AgentConfig {
    /// Load and validate the configuration at `path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: AgentConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_none() && self.client.is_none() {
            return Err(ConfigError::Invalid(
                "at least one of 'server' or 'client' must be configured".to_string(),
            ));
        }

        if let Some(server) = &self.server {
            server.validate()?;
        }
        if let Some(client) = &self.client {
            client.validate()?;
        }

        if let (Some(server), Some(client)) = (&self.server, &self.client) {
            let server_paths = [&server.target.cert_path, &server.target.key_path];
            let clash = [&client.target.cert_path, &client.target.key_path]
                .iter()
                .any(|path| server_paths.contains(path));
            if clash {
                return Err(ConfigError::Invalid(
                    "server and client agents must not share certificate or key paths".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl ServerAgentConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("server.domain_name", &self.domain_name)?;
        self.target.validate("server")?;

        if self.acme.challenge_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "server.acme.challenge_dir must not be empty".to_string(),
            ));
        }

        if let Some(reload) = &self.reload {
            require_non_empty("server.reload.target", &reload.target)?;
            if reload.command.is_empty() {
                return Err(ConfigError::Invalid(
                    "server.reload.command must not be empty".to_string(),
                ));
            }
            if reload.timeout_seconds == 0 {
                return Err(ConfigError::Invalid(
                    "server.reload.timeout_seconds must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl ClientAgentConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("client.device_name", &self.device_name)?;
        require_non_empty("client.subject_dn", &self.subject_dn)?;
        self.target.validate("client")?;

        if self.est.request_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "client.est.request_timeout_seconds must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

fn default_reload_command() -> Vec<String> {
    ["docker", "exec", "{target}", "sh", "-c", "nginx -t && nginx -s reload"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_reload_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}
