use super::HostId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection status of one session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn display_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting...",
        }
    }
}

/// Snapshot of a session's observable state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub host_id: HostId,
    pub status: ConnectionStatus,
    /// Set while connected
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SessionRecord {
    pub fn new(host_id: HostId) -> Self {
        Self {
            host_id,
            status: ConnectionStatus::Disconnected,
            connected_at: None,
            last_error: None,
        }
    }

    /// Time since the session connected
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|at| Utc::now() - at)
    }

    /// Format duration for display
    pub fn format_duration(&self) -> String {
        let Some(duration) = self.duration() else {
            return "-".to_string();
        };
        let hours = duration.num_hours();
        let minutes = duration.num_minutes() % 60;
        let seconds = duration.num_seconds() % 60;

        if hours > 0 {
            format!("{}h {}m", hours, minutes)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }
}

/// Format a byte count for display
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_disconnected() {
        let record = SessionRecord::new(HostId::new("h1"));
        assert_eq!(record.status, ConnectionStatus::Disconnected);
        assert!(record.connected_at.is_none());
        assert_eq!(record.format_duration(), "-");
    }

    #[test]
    fn test_format_duration() {
        let mut record = SessionRecord::new(HostId::new("h1"));
        record.connected_at = Some(Utc::now() - chrono::Duration::seconds(125));
        assert_eq!(record.format_duration(), "2m 5s");

        record.connected_at = Some(Utc::now() - chrono::Duration::minutes(190));
        assert_eq!(record.format_duration(), "3h 10m");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(300), "300 B");
        assert!(format_bytes(1024 * 10).contains("KB"));
        assert!(format_bytes(1024 * 1024 * 2).contains("MB"));
        assert!(format_bytes(1024 * 1024 * 1024 * 2).contains("GB"));
    }

    #[test]
    fn test_status_display_str() {
        assert_eq!(ConnectionStatus::Connecting.display_str(), "Connecting...");
        assert_eq!(ConnectionStatus::Reconnecting.display_str(), "Reconnecting...");
        assert!(ConnectionStatus::Connected.is_connected());
        assert!(!ConnectionStatus::Reconnecting.is_connected());
    }
}
