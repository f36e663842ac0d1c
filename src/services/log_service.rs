use crate::models::{ConnectionEvent, ConnectionLog, HostId, LogLevel};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, RwLock};

/// Status log: a bounded ring of human-readable transition messages
pub struct LogService {
    /// In-memory log buffer (most recent logs)
    logs: RwLock<VecDeque<ConnectionLog>>,

    /// Maximum logs to keep in memory
    max_memory_logs: usize,

    /// Optional log file path
    log_file_path: Option<PathBuf>,

    subscribers: broadcast::Sender<ConnectionLog>,
}

impl LogService {
    /// Create a new log service
    pub fn new(max_memory_logs: usize) -> Self {
        let (subscribers, _) = broadcast::channel(64);
        Self {
            logs: RwLock::new(VecDeque::with_capacity(max_memory_logs)),
            max_memory_logs,
            log_file_path: None,
            subscribers,
        }
    }

    /// Create with file logging enabled
    pub fn with_file(mut self, log_file_path: PathBuf) -> Self {
        self.log_file_path = Some(log_file_path);
        self
    }

    /// Receive every entry logged from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionLog> {
        self.subscribers.subscribe()
    }

    /// Log a connection event
    pub async fn log(
        &self,
        host_id: &HostId,
        host_name: &str,
        event: ConnectionEvent,
    ) -> ConnectionLog {
        let entry = ConnectionLog::new(host_id.clone(), host_name, event);
        self.log_entry(entry.clone()).await;
        entry
    }

    async fn log_entry(&self, log_entry: ConnectionLog) {
        {
            let mut logs = self.logs.write().await;

            // Remove oldest if at capacity
            if logs.len() >= self.max_memory_logs {
                logs.pop_front();
            }

            logs.push_back(log_entry.clone());
        }

        if let Some(ref file_path) = self.log_file_path {
            if let Err(e) = Self::write_to_file(file_path, &log_entry).await {
                tracing::warn!("Failed to write log file {}: {}", file_path.display(), e);
            }
        }

        // Also log via tracing
        match log_entry.level {
            LogLevel::Info => tracing::info!("{}", log_entry.format()),
            LogLevel::Warning => tracing::warn!("{}", log_entry.format()),
            LogLevel::Error => tracing::error!("{}", log_entry.format()),
        }

        // No subscribers is fine
        let _ = self.subscribers.send(log_entry);
    }

    async fn write_to_file(file_path: &Path, log_entry: &ConnectionLog) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)
            .await?;

        let log_line = format!("{}\n", log_entry.format());
        file.write_all(log_line.as_bytes()).await?;
        file.flush().await
    }

    /// Get all logs in memory
    pub async fn get_logs(&self) -> Vec<ConnectionLog> {
        let logs = self.logs.read().await;
        logs.iter().cloned().collect()
    }

    /// Get logs for a specific host
    pub async fn get_logs_for_host(&self, host_id: &HostId) -> Vec<ConnectionLog> {
        let logs = self.logs.read().await;
        logs.iter()
            .filter(|log| &log.host_id == host_id)
            .cloned()
            .collect()
    }

    /// Get logs filtered by level
    pub async fn get_logs_by_level(&self, level: LogLevel) -> Vec<ConnectionLog> {
        let logs = self.logs.read().await;
        logs.iter().filter(|log| log.level == level).cloned().collect()
    }

    /// Clear all in-memory logs
    pub async fn clear(&self) {
        self.logs.write().await.clear();
    }

    /// Get recent logs (last N)
    pub async fn get_recent(&self, count: usize) -> Vec<ConnectionLog> {
        let logs = self.logs.read().await;
        let skip = logs.len().saturating_sub(count);
        logs.iter().skip(skip).cloned().collect()
    }
}

/// Reports events for one host into the shared status log
#[derive(Clone)]
pub struct StatusReporter {
    host_id: HostId,
    host_name: String,
    log: Arc<LogService>,
}

impl StatusReporter {
    pub fn new(host_id: HostId, host_name: impl Into<String>, log: Arc<LogService>) -> Self {
        Self {
            host_id,
            host_name: host_name.into(),
            log,
        }
    }

    pub fn host_id(&self) -> &HostId {
        &self.host_id
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn log_service(&self) -> &Arc<LogService> {
        &self.log
    }

    pub async fn report(&self, event: ConnectionEvent) -> ConnectionLog {
        self.log.log(&self.host_id, &self.host_name, event).await
    }
}
