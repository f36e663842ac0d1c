use super::{AuthMethod, Credentials, TunnelRule};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted host configuration id; the only key sessions are registered under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// SSH host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Unique identifier
    #[serde(default = "HostId::generate")]
    pub id: HostId,

    /// Display name
    pub name: String,

    /// SSH host
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub username: String,

    #[serde(default)]
    pub auth: AuthMethod,

    /// Local port forwarding rules
    #[serde(default)]
    pub tunnels: Vec<TunnelRule>,

    /// Re-establish the session after an unexpected disconnect
    #[serde(default)]
    pub auto_reconnect: bool,

    /// Expected server host key fingerprint (SHA256)
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,

    /// If false, any host key is accepted
    #[serde(default)]
    pub verify_host_key: bool,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_ssh_port() -> u16 {
    22
}

impl HostConfig {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: HostId::generate(),
            name: name.into(),
            host: host.into(),
            port: default_ssh_port(),
            username: username.into(),
            auth: AuthMethod::default(),
            tunnels: vec![],
            auto_reconnect: false,
            host_key_fingerprint: None,
            verify_host_key: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<HostId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, auth: AuthMethod) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_tunnel(mut self, rule: TunnelRule) -> Self {
        self.tunnels.push(rule);
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Update the last modified timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn display_name(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// Everything a session needs to open a connection to this host
    pub fn target(&self, credentials: Credentials) -> ConnectTarget {
        ConnectTarget {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            credentials,
            host_key_fingerprint: self.host_key_fingerprint.clone(),
            verify_host_key: self.verify_host_key,
        }
    }
}

/// Resolved connection parameters handed to a `Connector`
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectTarget {
    /// Display name used in status messages
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    pub host_key_fingerprint: Option<String>,
    pub verify_host_key: bool,
}

impl ConnectTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
