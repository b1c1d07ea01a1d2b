//! Settings shared by every managed certificate

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{require_non_empty, ConfigError};

/// One certificate/key pair owned by exactly one agent
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CertificateTarget {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Renew once this share of the validity window has elapsed
    #[serde(default = "default_threshold")]
    pub renewal_threshold_pct: u8,
    #[serde(default = "default_interval")]
    pub check_interval_seconds: u64,
    /// ACME directory or EST base URL
    pub pki_url: String,
    #[serde(default)]
    pub crl: CrlConfig,
    /// Issuer chain without the leaf
    #[serde(default)]
    pub chain_path: Option<PathBuf>,
    /// Leaf followed by the issuer chain
    #[serde(default)]
    pub fullchain_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CrlConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    #[serde(default = "default_max_age")]
    pub max_age_hours: u64,
}

impl Default for CrlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            cache_path: None,
            max_age_hours: default_max_age(),
        }
    }
}

impl AsRef<CertificateTarget> for CertificateTarget {
    fn as_ref(&self) -> &CertificateTarget {
        self
    }
}

impl CertificateTarget {
    pub(crate) fn validate(&self, agent: &str) -> Result<(), ConfigError> {
        if self.cert_path.as_os_str().is_empty() || self.key_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{agent}: cert_path and key_path must not be empty"
            )));
        }
        if self.cert_path == self.key_path {
            return Err(ConfigError::Invalid(format!(
                "{agent}: cert_path and key_path must differ"
            )));
        }
        if self.renewal_threshold_pct > 100 {
            return Err(ConfigError::Invalid(format!(
                "{agent}: renewal_threshold_pct must be between 0 and 100, got {}",
                self.renewal_threshold_pct
            )));
        }
        if self.check_interval_seconds == 0 {
            return Err(ConfigError::Invalid(format!(
                "{agent}: check_interval_seconds must be greater than 0"
            )));
        }
        require_non_empty(&format!("{agent}.pki_url"), &self.pki_url)?;

        if self.crl.enabled {
            let has_url = self.crl.url.as_deref().is_some_and(|url| !url.trim().is_empty());
            let has_cache = self
                .crl
                .cache_path
                .as_ref()
                .is_some_and(|path| !path.as_os_str().is_empty());
            if !has_url || !has_cache {
                return Err(ConfigError::Invalid(format!(
                    "{agent}: crl.url and crl.cache_path are required when CRL checking is enabled"
                )));
            }
        }
        Ok(())
    }
}

fn default_threshold() -> u8 {
    80
}

fn default_interval() -> u64 {
    3600
}

fn default_max_age() -> u64 {
    24
}
