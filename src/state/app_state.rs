use crate::models::{HostId, SessionRecord};
use crate::services::config_service::{AppSettings, HostConfigStore};
use crate::services::credentials::CredentialProvider;
use crate::services::log_service::LogService;
use crate::services::reconnect::{ReconnectCoordinator, ReconnectPolicy};
use crate::services::session::{Session, SessionSettings};
use crate::services::session_registry::SessionRegistry;
use crate::services::transport::Connector;
use crate::utils::error::{ConsoleError, Result, TunnelError};
use std::sync::Arc;

/// Application global state
pub struct AppState {
    /// Persisted host configurations
    pub store: Arc<dyn HostConfigStore>,

    pub credentials: Arc<dyn CredentialProvider>,

    /// Status log shared by every session
    pub log: Arc<LogService>,

    pub registry: Arc<SessionRegistry>,

    pub reconnect: Arc<ReconnectCoordinator>,
}

impl AppState {
    /// Wire everything together and start listening for lost connections
    pub async fn new(
        store: Arc<dyn HostConfigStore>,
        credentials: Arc<dyn CredentialProvider>,
        connector: Arc<dyn Connector>,
        log: Arc<LogService>,
        settings: &AppSettings,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            connector,
            SessionSettings::from(settings),
            log.clone(),
        ));
        let reconnect = ReconnectCoordinator::new(
            registry.clone(),
            store.clone(),
            credentials.clone(),
            log.clone(),
            ReconnectPolicy::from(settings),
        );
        reconnect.start().await;

        Self {
            store,
            credentials,
            log,
            registry,
            reconnect,
        }
    }

    /// Connect a host with its latest config and start its tunnels.
    /// Wins over a reconnect loop running for the same host; the loop keeps
    /// ownership of the reconnecting flag and clears it when it sees the
    /// session connected.
    pub async fn connect_host(&self, host_id: &HostId) -> Result<Session> {
        let host = self
            .store
            .host_config(host_id)
            .await?
            .ok_or_else(|| ConsoleError::HostNotFound(host_id.to_string()))?;
        let credentials = self.credentials.resolve(&host).await?;
        let target = host.target(credentials);

        let session = self.registry.get_or_create(host_id, target.clone()).await;
        if session.status().is_connected() {
            return Ok(session);
        }

        session.set_target(target).await;
        session.connect().await?;

        let rules = match self.store.host_config(host_id).await {
            Ok(Some(latest)) => latest.tunnels,
            _ => host.tunnels,
        };
        session.load_port_forwarding_rules(rules).await;
        Ok(session)
    }

    /// Stop any reconnect loop, disconnect and forget the host's session
    pub async fn disconnect_host(&self, host_id: &HostId) {
        self.reconnect.cancel(host_id).await;
        if let Some(session) = self.registry.remove(host_id).await {
            session.disconnect().await;
        }
    }

    /// Flip one tunnel of a host; returns the new active flag
    pub async fn toggle_tunnel(&self, host_id: &HostId, tunnel_id: &str) -> Result<bool> {
        let session = self
            .registry
            .get(host_id)
            .await
            .ok_or(TunnelError::NotConnected)?;
        Ok(session.tunnels().toggle(tunnel_id).await?)
    }

    pub async fn set_auto_reconnect(&self, host_id: &HostId, enabled: bool) {
        self.reconnect.set_enabled(host_id, enabled).await;
    }

    pub async fn session(&self, host_id: &HostId) -> Option<Session> {
        self.registry.get(host_id).await
    }

    /// Status snapshots of every known session
    pub async fn sessions(&self) -> Vec<SessionRecord> {
        self.registry.list().await
    }

    pub async fn shutdown(&self) {
        self.reconnect.shutdown().await;
        self.registry.disconnect_all().await;
    }
}
