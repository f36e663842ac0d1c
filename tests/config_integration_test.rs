//! Integration tests for ConfigService
//!
//! These tests verify the complete workflow of configuration management,
//! including file I/O, host CRUD operations and tunnel rule edits.

use ssh_console::models::{AuthMethod, HostConfig, HostId, TunnelRule};
use ssh_console::services::config_service::{
    AppSettings, ConfigService, HostConfigStore, MemoryConfigStore,
};
use tempfile::TempDir;

/// Helper to create a test config service with a temporary directory
fn create_test_config_service() -> (ConfigService, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let service = ConfigService::with_dir(temp_dir.path().to_path_buf())
        .expect("Failed to create config service");
    (service, temp_dir)
}

// =============================================================================
// Host CRUD Integration Tests
// =============================================================================

#[test]
fn test_full_host_lifecycle() {
    let (service, _temp) = create_test_config_service();

    // Create
    let host = HostConfig::new("Production Server", "prod.example.com", "admin");
    let host_id = host.id.clone();
    service.save_host(&host).expect("Failed to add host");

    // Read
    let retrieved = service
        .get_host(&host_id)
        .expect("Failed to get host")
        .expect("Host should exist");
    assert_eq!(retrieved.name, "Production Server");
    assert_eq!(retrieved.host, "prod.example.com");

    // Update
    let mut updated = retrieved;
    updated.name = "Production Server (Updated)".to_string();
    updated.port = 2222;
    service.save_host(&updated).expect("Failed to update host");

    let after_update = service.get_host(&host_id).unwrap().unwrap();
    assert_eq!(after_update.name, "Production Server (Updated)");
    assert_eq!(after_update.port, 2222);
    assert!(after_update.updated_at >= after_update.created_at);

    // Delete
    assert!(service.delete_host(&host_id).expect("Failed to delete host"));
    assert!(service.get_host(&host_id).unwrap().is_none());
    assert!(!service.delete_host(&host_id).unwrap());
}

#[test]
fn test_find_host_by_id_or_name() {
    let (service, _temp) = create_test_config_service();
    let host = HostConfig::new("web-1", "10.0.0.1", "deploy").with_id("abc");
    service.save_host(&host).unwrap();

    assert_eq!(service.find_host("abc").unwrap().unwrap().name, "web-1");
    assert_eq!(
        service.find_host("web-1").unwrap().unwrap().id,
        HostId::new("abc")
    );
    assert!(service.find_host("missing").unwrap().is_none());
}

#[test]
fn test_host_with_auth_methods() {
    let (service, _temp) = create_test_config_service();

    let password_host = HostConfig::new("Password Auth", "host1.com", "user");
    service.save_host(&password_host).expect("Failed to add");

    let key_host = HostConfig::new("Key Auth", "host2.com", "user")
        .with_auth(AuthMethod::public_key("/home/user/.ssh/id_rsa", false));
    service.save_host(&key_host).expect("Failed to add");

    let retrieved = service.get_host(&password_host.id).unwrap().unwrap();
    assert!(matches!(retrieved.auth, AuthMethod::Password));

    let retrieved = service.get_host(&key_host.id).unwrap().unwrap();
    match &retrieved.auth {
        AuthMethod::PublicKey {
            private_key_path, ..
        } => {
            assert_eq!(private_key_path.to_str().unwrap(), "/home/user/.ssh/id_rsa");
        }
        _ => panic!("Expected PublicKey auth method"),
    }
}

// =============================================================================
// Tunnel Rule Integration Tests
// =============================================================================

#[test]
fn test_update_tunnel_rules_persists() {
    let (service, _temp) = create_test_config_service();
    let host = HostConfig::new("db", "db.example.com", "root");
    service.save_host(&host).unwrap();

    let rules = vec![
        TunnelRule::new(13306, "localhost", 3306).with_auto_start(true),
        TunnelRule::new(16379, "cache.internal", 6379),
    ];
    service.update_tunnel_rules(&host.id, rules).unwrap();

    let stored = service.get_host(&host.id).unwrap().unwrap();
    assert_eq!(stored.tunnels.len(), 2);
    assert!(stored.tunnels[0].auto_start);
    assert_eq!(stored.tunnels[1].remote_host, "cache.internal");
}

#[test]
fn test_duplicate_local_ports_rejected() {
    let (service, _temp) = create_test_config_service();
    let host = HostConfig::new("db", "db.example.com", "root");
    service.save_host(&host).unwrap();

    let rules = vec![
        TunnelRule::new(8080, "localhost", 80),
        TunnelRule::new(8080, "localhost", 81),
    ];
    assert!(service.update_tunnel_rules(&host.id, rules).is_err());
    assert!(service.get_host(&host.id).unwrap().unwrap().tunnels.is_empty());
}

#[test]
fn test_update_rules_for_unknown_host_fails() {
    let (service, _temp) = create_test_config_service();
    let result = service.update_tunnel_rules(&HostId::new("nope"), vec![]);
    assert!(result.is_err());
}

#[tokio::test]
async fn test_store_reads_latest_file_contents() {
    let (service, temp) = create_test_config_service();
    let host = HostConfig::new("web", "web.example.com", "root");
    service.save_host(&host).unwrap();

    // A second service over the same directory stands in for another process
    let other = ConfigService::with_dir(temp.path().to_path_buf()).unwrap();
    other.set_auto_reconnect(&host.id, true).unwrap();

    let latest = service.host_config(&host.id).await.unwrap().unwrap();
    assert!(latest.auto_reconnect);
}

#[tokio::test]
async fn test_memory_store_edits() {
    let store = MemoryConfigStore::new();
    let host = HostConfig::new("web", "web.example.com", "root").with_id("h1");
    store.upsert(host).await;

    store
        .update_tunnel_rules(&HostId::new("h1"), vec![TunnelRule::new(9000, "localhost", 80)])
        .await
        .unwrap();
    store
        .edit(&HostId::new("h1"), |h| h.auto_reconnect = true)
        .await
        .unwrap();

    let stored = store.host_config(&HostId::new("h1")).await.unwrap().unwrap();
    assert_eq!(stored.tunnels.len(), 1);
    assert!(stored.auto_reconnect);
    assert!(store.edit(&HostId::new("h2"), |_| {}).await.is_err());
}

// =============================================================================
// Settings Integration Tests
// =============================================================================

#[test]
fn test_settings_roundtrip_and_defaults() {
    let (service, _temp) = create_test_config_service();

    let defaults = service.load_settings().unwrap();
    assert_eq!(defaults.max_reconnect_attempts, 5);
    assert_eq!(defaults.reconnect_base_delay_ms, 2000);

    let settings = AppSettings {
        language: "zh-CN".to_string(),
        max_reconnect_attempts: 3,
        ..AppSettings::default()
    };
    service.save_settings(&settings).unwrap();

    let loaded = service.load_settings().unwrap();
    assert_eq!(loaded.language, "zh-CN");
    assert_eq!(loaded.max_reconnect_attempts, 3);
    assert_eq!(loaded.tail_history_lines, 200);
}

#[test]
fn test_partial_settings_file_uses_defaults() {
    let (service, temp) = create_test_config_service();
    std::fs::write(temp.path().join("settings.toml"), "language = \"en\"\n").unwrap();

    let settings = service.load_settings().unwrap();
    assert_eq!(settings.command_timeout_seconds, 30);
    assert_eq!(settings.default_bind_address, "127.0.0.1");
}
