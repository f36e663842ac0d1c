use serde::{Deserialize, Serialize};

/// Local port forwarding rule (-L)
/// Maps a local port to a remote host:port through the host's session
/// Example: -L 13306:10.0.0.5:3306
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelRule {
    /// Stable rule identifier
    #[serde(default = "new_rule_id")]
    pub id: String,
    /// Local port to listen on
    pub local_port: u16,
    /// Remote host to connect to, as seen from the SSH server
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    /// Remote port to connect to
    pub remote_port: u16,
    /// Bind address (default: "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub description: String,
    /// Start as soon as the owning session is connected
    #[serde(default)]
    pub auto_start: bool,
}

fn new_rule_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_remote_host() -> String {
    "localhost".to_string()
}

pub(crate) fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

impl TunnelRule {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            id: new_rule_id(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            bind_address: default_bind_address(),
            description: String::new(),
            auto_start: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.local_port)
    }

    /// Get description for display
    pub fn display(&self) -> String {
        let route = format!(
            "{}:{} → {}:{}",
            self.bind_address, self.local_port, self.remote_host, self.remote_port
        );
        if self.description.is_empty() {
            route
        } else {
            format!("{} ({})", self.description, route)
        }
    }
}

/// Point-in-time view of one tunnel for status rendering
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelStatus {
    pub rule: TunnelRule,
    pub active: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_rule_defaults() {
        let rule = TunnelRule::new(13306, "10.0.0.5", 3306);
        assert_eq!(rule.local_port, 13306);
        assert_eq!(rule.remote_host, "10.0.0.5");
        assert_eq!(rule.remote_port, 3306);
        assert_eq!(rule.bind_address, "127.0.0.1");
        assert!(!rule.auto_start);
        assert!(!rule.id.is_empty());
    }

    #[test]
    fn test_display() {
        let rule = TunnelRule::new(13306, "10.0.0.5", 3306);
        assert_eq!(rule.display(), "127.0.0.1:13306 → 10.0.0.5:3306");

        let rule = rule.with_description("MySQL");
        assert_eq!(rule.display(), "MySQL (127.0.0.1:13306 → 10.0.0.5:3306)");
    }

    #[test]
    fn test_deserialize_minimal_rule() {
        let rule: TunnelRule = toml::from_str("local_port = 8080\nremote_port = 80").unwrap();
        assert_eq!(rule.remote_host, "localhost");
        assert_eq!(rule.bind_address, "127.0.0.1");
        assert!(!rule.id.is_empty());
    }
}
