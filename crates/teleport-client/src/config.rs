//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunnel agent configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Control endpoint host, also sent as the handshake `Host`
    pub server_host: String,
    pub server_port: u16,
    pub username: String,
    pub password: String,
    /// Address of the service being exposed
    pub local_addr: String,
    /// Negotiate a session key and seal all tunnel traffic
    pub encryption: bool,
    /// Concurrent connections to the local service
    pub max_connections: usize,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl AgentConfig {
    /// `host:port` of the control endpoint
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_host: "localhost".to_string(),
            server_port: 9999,
            username: String::new(),
            password: String::new(),
            local_addr: "127.0.0.1:8000".to_string(),
            encryption: true,
            max_connections: 100,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("server_host", &self.server_host)
            .field("server_port", &self.server_port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("local_addr", &self.local_addr)
            .field("encryption", &self.encryption)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Serialize a Duration as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
