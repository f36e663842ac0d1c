use super::HostId;
use chrono::{DateTime, Utc};
use rust_i18n::t;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status log entry, one per state transition or terminal failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLog {
    pub id: Uuid,

    pub host_id: HostId,

    /// Host display name at the time of the event
    pub host_name: String,

    pub level: LogLevel,

    pub event: ConnectionEvent,

    /// Human-readable message in the active language
    pub message: String,

    pub timestamp: DateTime<Utc>,
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Connection event types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    ConnectionFailed { reason: String },
    /// User-initiated disconnect
    Disconnected,
    /// The transport dropped underneath a connected session
    ConnectionLost,
    ReconnectStarted,
    ReconnectAttemptFailed {
        attempt: u32,
        max_attempts: u32,
        reason: String,
    },
    Reconnected { attempts: u32 },
    /// Another connect finished first; the loop stopped without connecting
    ReconnectRestored,
    ReconnectFailed { attempts: u32 },
    ReconnectCancelled,
    TunnelStarted { local_port: u16, remote: String },
    TunnelStopped { local_port: u16 },
    TunnelFailed { local_port: u16, reason: String },
    RulesLoaded { count: usize },
    CommandStarted { command: String },
    TailStarted { path: String },
    TailStopped { path: String },
}

impl ConnectionEvent {
    pub fn level(&self) -> LogLevel {
        match self {
            Self::ConnectionFailed { .. }
            | Self::ReconnectFailed { .. }
            | Self::TunnelFailed { .. } => LogLevel::Error,
            Self::ConnectionLost
            | Self::ReconnectAttemptFailed { .. }
            | Self::ReconnectCancelled => LogLevel::Warning,
            _ => LogLevel::Info,
        }
    }

    /// Render the localized message for this event
    pub fn describe(&self, host: &str) -> String {
        match self {
            Self::Connecting => t!("log.connecting", host = host).to_string(),
            Self::Connected => t!("log.connected", host = host).to_string(),
            Self::ConnectionFailed { reason } => {
                t!("log.connection_failed", host = host, reason = reason).to_string()
            }
            Self::Disconnected => t!("log.disconnected", host = host).to_string(),
            Self::ConnectionLost => t!("log.connection_lost", host = host).to_string(),
            Self::ReconnectStarted => t!("log.reconnect_started", host = host).to_string(),
            Self::ReconnectAttemptFailed {
                attempt,
                max_attempts,
                reason,
            } => t!(
                "log.reconnect_attempt_failed",
                host = host,
                attempt = attempt,
                max = max_attempts,
                reason = reason
            )
            .to_string(),
            Self::Reconnected { attempts } => {
                t!("log.reconnected", host = host, attempts = attempts).to_string()
            }
            Self::ReconnectRestored => t!("log.reconnect_restored", host = host).to_string(),
            Self::ReconnectFailed { attempts } => {
                t!("log.reconnect_failed", host = host, attempts = attempts).to_string()
            }
            Self::ReconnectCancelled => t!("log.reconnect_cancelled", host = host).to_string(),
            Self::TunnelStarted { local_port, remote } => {
                t!("log.tunnel_started", port = local_port, remote = remote).to_string()
            }
            Self::TunnelStopped { local_port } => {
                t!("log.tunnel_stopped", port = local_port).to_string()
            }
            Self::TunnelFailed { local_port, reason } => {
                t!("log.tunnel_failed", port = local_port, reason = reason).to_string()
            }
            Self::RulesLoaded { count } => {
                t!("log.rules_loaded", host = host, count = count).to_string()
            }
            Self::CommandStarted { command } => {
                t!("log.command_started", command = command).to_string()
            }
            Self::TailStarted { path } => t!("log.tail_started", path = path).to_string(),
            Self::TailStopped { path } => t!("log.tail_stopped", path = path).to_string(),
        }
    }
}

impl ConnectionLog {
    pub fn new(host_id: HostId, host_name: impl Into<String>, event: ConnectionEvent) -> Self {
        let host_name = host_name.into();
        Self {
            id: Uuid::new_v4(),
            message: event.describe(&host_name),
            level: event.level(),
            host_id,
            host_name,
            event,
            timestamp: Utc::now(),
        }
    }

    /// Format for display
    pub fn format(&self) -> String {
        let timestamp = self.timestamp.format("%Y-%m-%d %H:%M:%S");
        let level = match self.level {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
        };

        format!(
            "[{}] {} | {} | {}",
            timestamp, level, self.host_name, self.message
        )
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}
