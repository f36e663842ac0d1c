use crate::models::{HostConfig, HostId, TunnelRule};
use crate::utils::error::{ConsoleError, Result};
use async_trait::async_trait;
use directories::ProjectDirs;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;

/// Source of persisted host configurations.
///
/// `host_config` always returns the latest persisted value; callers re-read it
/// instead of holding on to copies.
#[async_trait]
pub trait HostConfigStore: Send + Sync {
    async fn host_config(&self, id: &HostId) -> Result<Option<HostConfig>>;
}

/// Reject rule sets where two rules claim the same local port
pub fn check_port_conflicts(rules: &[TunnelRule]) -> Result<()> {
    let mut seen = HashSet::new();
    for rule in rules {
        if !seen.insert(rule.local_port) {
            return Err(ConsoleError::ConfigError(format!(
                "local port {} is used by more than one tunnel",
                rule.local_port
            )));
        }
    }
    Ok(())
}

/// Service for managing configuration persistence
pub struct ConfigService {
    config_dir: PathBuf,
}

impl ConfigService {
    /// Create a new config service with default directory
    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir()?;

        // Create config directory if it doesn't exist
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
            tracing::info!("Created config directory: {:?}", config_dir);

            // Set permissions to 0700 on Unix
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = fs::metadata(&config_dir)?.permissions();
                perms.set_mode(0o700);
                fs::set_permissions(&config_dir, perms)?;
            }
        }

        Ok(Self { config_dir })
    }

    /// Create a config service with custom directory
    pub fn with_dir(config_dir: PathBuf) -> Result<Self> {
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
        }
        Ok(Self { config_dir })
    }

    fn get_config_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "ssh-console", "ssh-console")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or_else(|| ConsoleError::ConfigError("Failed to get config directory".to_string()))
    }

    fn hosts_file(&self) -> PathBuf {
        self.config_dir.join("hosts.toml")
    }

    fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.toml")
    }

    /// Default location of the status log file
    pub fn status_log_file(&self) -> PathBuf {
        self.config_dir.join("status.log")
    }

    /// Load all hosts
    pub fn load_hosts(&self) -> Result<Vec<HostConfig>> {
        let path = self.hosts_file();

        if !path.exists() {
            tracing::debug!("No hosts file found, returning empty list");
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)?;
        let hosts: HostsConfig = toml::from_str(&content)
            .map_err(|e| ConsoleError::ConfigError(format!("Failed to parse hosts: {}", e)))?;

        tracing::debug!("Loaded {} hosts", hosts.hosts.len());
        Ok(hosts.hosts)
    }

    /// Save all hosts
    pub fn save_hosts(&self, hosts: &[HostConfig]) -> Result<()> {
        let config = HostsConfig {
            hosts: hosts.to_vec(),
        };
        let content = toml::to_string_pretty(&config)?;

        let path = self.hosts_file();
        fs::write(&path, content)?;

        tracing::info!("Saved {} hosts to {:?}", hosts.len(), path);
        Ok(())
    }

    /// Save a single host (update or create)
    pub fn save_host(&self, host: &HostConfig) -> Result<()> {
        check_port_conflicts(&host.tunnels)?;
        let mut hosts = self.load_hosts()?;

        if let Some(pos) = hosts.iter().position(|h| h.id == host.id) {
            let mut updated = host.clone();
            updated.touch();
            hosts[pos] = updated;
            tracing::info!("Updated host: {}", host.name);
        } else {
            hosts.push(host.clone());
            tracing::info!("Added new host: {}", host.name);
        }

        self.save_hosts(&hosts)
    }

    /// Delete a host by ID
    pub fn delete_host(&self, id: &HostId) -> Result<bool> {
        let mut hosts = self.load_hosts()?;
        let original_len = hosts.len();

        hosts.retain(|h| &h.id != id);

        if hosts.len() < original_len {
            self.save_hosts(&hosts)?;
            tracing::info!("Deleted host with ID: {}", id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn get_host(&self, id: &HostId) -> Result<Option<HostConfig>> {
        Ok(self.load_hosts()?.into_iter().find(|h| &h.id == id))
    }

    /// Find a host by id or, failing that, by name
    pub fn find_host(&self, key: &str) -> Result<Option<HostConfig>> {
        let hosts = self.load_hosts()?;
        let by_id = hosts.iter().position(|h| h.id.as_str() == key);
        let index = by_id.or_else(|| hosts.iter().position(|h| h.name == key));
        Ok(index.map(|i| hosts[i].clone()))
    }

    /// Replace a host's tunnel rules
    pub fn update_tunnel_rules(&self, id: &HostId, rules: Vec<TunnelRule>) -> Result<HostConfig> {
        check_port_conflicts(&rules)?;
        let mut host = self
            .get_host(id)?
            .ok_or_else(|| ConsoleError::HostNotFound(id.to_string()))?;
        host.tunnels = rules;
        self.save_host(&host)?;
        Ok(host)
    }

    pub fn set_auto_reconnect(&self, id: &HostId, enabled: bool) -> Result<()> {
        let mut host = self
            .get_host(id)?
            .ok_or_else(|| ConsoleError::HostNotFound(id.to_string()))?;
        host.auto_reconnect = enabled;
        self.save_host(&host)
    }

    /// Load application settings
    pub fn load_settings(&self) -> Result<AppSettings> {
        let path = self.settings_file();

        if !path.exists() {
            tracing::info!("No settings file found, using defaults");
            return Ok(AppSettings::default());
        }

        let content = fs::read_to_string(&path)?;
        let settings: AppSettings = toml::from_str(&content)
            .map_err(|e| ConsoleError::ConfigError(format!("Failed to parse settings: {}", e)))?;

        tracing::info!("Loaded settings: language={}", settings.language);
        Ok(settings)
    }

    /// Save application settings
    pub fn save_settings(&self, settings: &AppSettings) -> Result<()> {
        let content = toml::to_string_pretty(settings)?;

        let path = self.settings_file();
        fs::write(&path, content)?;

        tracing::info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Get the config directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

#[async_trait]
impl HostConfigStore for ConfigService {
    async fn host_config(&self, id: &HostId) -> Result<Option<HostConfig>> {
        // Read the file on every call so edits made elsewhere are picked up
        self.get_host(id)
    }
}

// Helper struct for TOML serialization
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct HostsConfig {
    #[serde(default)]
    hosts: Vec<HostConfig>,
}

/// In-process `HostConfigStore`
#[derive(Default)]
pub struct MemoryConfigStore {
    hosts: RwLock<HashMap<HostId, HostConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, host: HostConfig) {
        self.hosts.write().await.insert(host.id.clone(), host);
    }

    pub async fn remove(&self, id: &HostId) -> Option<HostConfig> {
        self.hosts.write().await.remove(id)
    }

    pub async fn update_tunnel_rules(&self, id: &HostId, rules: Vec<TunnelRule>) -> Result<()> {
        check_port_conflicts(&rules)?;
        let mut hosts = self.hosts.write().await;
        let host = hosts
            .get_mut(id)
            .ok_or_else(|| ConsoleError::HostNotFound(id.to_string()))?;
        host.tunnels = rules;
        host.touch();
        Ok(())
    }

    /// Apply an arbitrary edit to a stored host
    pub async fn edit(&self, id: &HostId, edit: impl FnOnce(&mut HostConfig)) -> Result<()> {
        let mut hosts = self.hosts.write().await;
        let host = hosts
            .get_mut(id)
            .ok_or_else(|| ConsoleError::HostNotFound(id.to_string()))?;
        edit(host);
        host.touch();
        Ok(())
    }
}

#[async_trait]
impl HostConfigStore for MemoryConfigStore {
    async fn host_config(&self, id: &HostId) -> Result<Option<HostConfig>> {
        Ok(self.hosts.read().await.get(id).cloned())
    }
}

/// Application settings
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AppSettings {
    /// Message language (e.g., "en", "zh-CN")
    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Delay before attempt n is base × (n + 1)
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_seconds: u64,

    /// How often a connected session checks its transport
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_seconds: u64,

    /// Upper bound on tearing down streams and connections
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout_seconds: u64,

    /// Per statement
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,

    #[serde(default = "default_tail_history_lines")]
    pub tail_history_lines: usize,

    /// Default bind address for port forwarding
    #[serde(default = "default_bind_address")]
    pub default_bind_address: String,

    #[serde(default = "default_status_log_capacity")]
    pub status_log_capacity: usize,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    2000
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_keepalive_interval() -> u64 {
    10
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_cleanup_timeout() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    30
}

fn default_tail_history_lines() -> usize {
    200
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_status_log_capacity() -> usize {
    500
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            language: default_language(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            connect_timeout_seconds: default_connect_timeout(),
            keepalive_interval_seconds: default_keepalive_interval(),
            health_check_interval_seconds: default_health_check_interval(),
            cleanup_timeout_seconds: default_cleanup_timeout(),
            command_timeout_seconds: default_command_timeout(),
            tail_history_lines: default_tail_history_lines(),
            default_bind_address: default_bind_address(),
            status_log_capacity: default_status_log_capacity(),
        }
    }
}

impl AppSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuthMethod;
    use tempfile::TempDir;

    fn create_test_service() -> (ConfigService, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let service = ConfigService::with_dir(temp_dir.path().to_path_buf()).unwrap();
        (service, temp_dir)
    }

    #[test]
    fn test_save_and_load_hosts() {
        let (service, _temp) = create_test_service();

        let host = HostConfig::new("Test", "example.com", "user");
        service.save_host(&host).unwrap();
        let loaded = service.load_hosts().unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "Test");
        assert_eq!(loaded[0].id, host.id);
    }

    #[test]
    fn test_delete_host() {
        let (service, _temp) = create_test_service();

        let host = HostConfig::new("Test", "example.com", "user");
        service.save_host(&host).unwrap();

        assert!(service.delete_host(&host.id).unwrap());
        assert!(service.load_hosts().unwrap().is_empty());
        assert!(!service.delete_host(&host.id).unwrap());
    }

    #[test]
    fn test_update_existing_host() {
        let (service, _temp) = create_test_service();

        let mut host = HostConfig::new("Test", "example.com", "user");
        service.save_host(&host).unwrap();

        host.name = "Updated".to_string();
        host.port = 2222;
        service.save_host(&host).unwrap();

        let loaded = service.load_hosts().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "Updated");
        assert_eq!(loaded[0].port, 2222);
    }

    #[test]
    fn test_find_host_by_name_or_id() {
        let (service, _temp) = create_test_service();
        let host = HostConfig::new("web-1", "example.com", "user").with_id("h-1");
        service.save_host(&host).unwrap();

        assert!(service.find_host("h-1").unwrap().is_some());
        assert!(service.find_host("web-1").unwrap().is_some());
        assert!(service.find_host("nope").unwrap().is_none());
    }

    #[test]
    fn test_host_with_public_key_auth_round_trips() {
        let (service, _temp) = create_test_service();

        let host = HostConfig::new("Test", "example.com", "user")
            .with_auth(AuthMethod::public_key("/path/to/key", true))
            .with_tunnel(TunnelRule::new(13306, "db", 3306).with_auto_start(true));
        service.save_host(&host).unwrap();

        let loaded = service.get_host(&host.id).unwrap().unwrap();
        assert!(matches!(loaded.auth, AuthMethod::PublicKey { .. }));
        assert_eq!(loaded.tunnels, host.tunnels);
    }

    #[test]
    fn test_update_tunnel_rules_rejects_port_conflict() {
        let (service, _temp) = create_test_service();
        let host = HostConfig::new("Test", "example.com", "user");
        service.save_host(&host).unwrap();

        let result = service.update_tunnel_rules(
            &host.id,
            vec![
                TunnelRule::new(8080, "a", 80),
                TunnelRule::new(8080, "b", 80),
            ],
        );
        assert!(matches!(result, Err(ConsoleError::ConfigError(_))));

        let updated = service
            .update_tunnel_rules(&host.id, vec![TunnelRule::new(8080, "a", 80)])
            .unwrap();
        assert_eq!(updated.tunnels.len(), 1);
    }

    #[test]
    fn test_update_tunnel_rules_unknown_host() {
        let (service, _temp) = create_test_service();
        let result = service.update_tunnel_rules(&HostId::new("missing"), vec![]);
        assert!(matches!(result, Err(ConsoleError::HostNotFound(_))));
    }

    #[tokio::test]
    async fn test_store_reads_latest_file_contents() {
        let (service, _temp) = create_test_service();
        let host = HostConfig::new("Test", "example.com", "user");
        service.save_host(&host).unwrap();

        service.set_auto_reconnect(&host.id, true).unwrap();

        let fresh = service.host_config(&host.id).await.unwrap().unwrap();
        assert!(fresh.auto_reconnect);
    }

    #[test]
    fn test_settings_round_trip() {
        let (service, _temp) = create_test_service();

        let mut settings = AppSettings::default();
        settings.language = "zh-CN".to_string();
        settings.max_reconnect_attempts = 3;

        service.save_settings(&settings).unwrap();
        let loaded = service.load_settings().unwrap();

        assert_eq!(loaded.language, "zh-CN");
        assert_eq!(loaded.max_reconnect_attempts, 3);
    }

    #[test]
    fn test_app_settings_default() {
        let settings = AppSettings::default();

        assert_eq!(settings.language, "en");
        assert_eq!(settings.max_reconnect_attempts, 5);
        assert_eq!(settings.reconnect_base_delay_ms, 2000);
        assert_eq!(settings.command_timeout_seconds, 30);
        assert_eq!(settings.tail_history_lines, 200);
        assert_eq!(settings.default_bind_address, "127.0.0.1");
    }

    #[test]
    fn test_partial_settings_file_uses_defaults() {
        let settings: AppSettings = toml::from_str("language = \"zh-CN\"").unwrap();
        assert_eq!(settings.health_check_interval_seconds, 5);
        assert_eq!(settings.cleanup_timeout_seconds, 5);
    }

    #[tokio::test]
    async fn test_memory_store_rule_update() {
        let store = MemoryConfigStore::new();
        let host = HostConfig::new("Test", "example.com", "user");
        let id = host.id.clone();
        store.upsert(host).await;

        store
            .update_tunnel_rules(&id, vec![TunnelRule::new(9000, "svc", 80)])
            .await
            .unwrap();
        let fresh = store.host_config(&id).await.unwrap().unwrap();
        assert_eq!(fresh.tunnels.len(), 1);

        assert!(store.remove(&id).await.is_some());
        assert!(store.host_config(&id).await.unwrap().is_none());
    }
}
