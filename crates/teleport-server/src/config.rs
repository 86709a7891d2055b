//! Server configuration file
//!
//! JSON with camelCase keys. Every key is optional; see [`ServerConfig::default`].

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use teleport_auth::{TierLimits, TierTable};
use teleport_control::AdmissionPolicy;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Concurrency cap and refill rate for one tier
///
/// A bare number `n` means a cap of `n` refilled at `n` per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TierCap {
    Uniform(usize),
    #[serde(rename_all = "camelCase")]
    Explicit {
        max_concurrent: usize,
        rate_per_second: f64,
    },
}

impl TierCap {
    pub fn limits(&self) -> TierLimits {
        match *self {
            TierCap::Uniform(n) => TierLimits::uniform(n),
            TierCap::Explicit {
                max_concurrent,
                rate_per_second,
            } => TierLimits::new(max_concurrent, rate_per_second),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierCaps {
    pub free: TierCap,
    pub moderate: TierCap,
    pub high: TierCap,
}

impl Default for TierCaps {
    fn default() -> Self {
        Self {
            free: TierCap::Uniform(2),
            moderate: TierCap::Uniform(50),
            high: TierCap::Uniform(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Public port; also the port of the control endpoint
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: u16,
    /// Base domain. Tunnels get `<label>.<host>`, control connections use `<host>` itself.
    pub host: String,
    #[serde(alias = "addr")]
    pub bind_address: String,
    pub api_url_auth: String,
    pub api_url_details: Option<String>,
    #[serde(alias = "token")]
    pub billing_token: Option<String>,
    pub tier_caps: TierCaps,
    pub subdomain_prefix: String,
    pub session_timeout_secs: u64,
    pub encryption: bool,
    pub admission_policy: AdmissionPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9999,
            host: "localhost".to_string(),
            bind_address: "0.0.0.0".to_string(),
            api_url_auth: String::new(),
            api_url_details: None,
            billing_token: None,
            tier_caps: TierCaps::default(),
            subdomain_prefix: "teleport".to_string(),
            session_timeout_secs: 3600,
            encryption: true,
            admission_policy: AdmissionPolicy::Stop,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.session_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sessionTimeoutSecs must be positive".to_string(),
            ));
        }

        let caps = [
            ("free", self.tier_caps.free),
            ("moderate", self.tier_caps.moderate),
            ("high", self.tier_caps.high),
        ];
        for (tier, cap) in caps {
            let limits = cap.limits();
            if limits.max_concurrent == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tierCaps.{}: connection cap must be positive",
                    tier
                )));
            }
            if !(limits.rate_per_second > 0.0 && limits.rate_per_second.is_finite()) {
                return Err(ConfigError::Invalid(format!(
                    "tierCaps.{}: rate must be a positive number",
                    tier
                )));
            }
        }

        if self.api_url_details.is_some() != self.billing_token.is_some() {
            return Err(ConfigError::Invalid(
                "apiUrlDetails and billingToken must be set together".to_string(),
            ));
        }

        Ok(())
    }

    pub fn tier_table(&self) -> TierTable {
        TierTable::new(
            self.tier_caps.free.limits(),
            self.tier_caps.moderate.limits(),
            self.tier_caps.high.limits(),
        )
    }

    /// Host the control endpoint is registered under
    pub fn control_host(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}
