use crate::models::{ConnectTarget, ConnectionStatus, HostId, SessionRecord};
use crate::services::log_service::LogService;
use crate::services::session::{Session, SessionEvent, SessionSettings};
use crate::services::transport::Connector;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Live sessions, at most one per host
pub struct SessionRegistry {
    sessions: RwLock<HashMap<HostId, Session>>,
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    log: Arc<LogService>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: SessionSettings,
        log: Arc<LogService>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            sessions: RwLock::new(HashMap::new()),
            connector,
            settings,
            log,
            events,
        }
    }

    fn create(&self, host_id: &HostId, target: ConnectTarget) -> Session {
        Session::new(
            host_id.clone(),
            target,
            self.connector.clone(),
            self.settings,
            self.log.clone(),
            self.events.clone(),
        )
    }

    /// The host's session, or a new unconnected one
    pub async fn get_or_create(&self, host_id: &HostId, target: ConnectTarget) -> Session {
        if let Some(session) = self.sessions.read().await.get(host_id) {
            return session.clone();
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(host_id.clone())
            .or_insert_with(|| {
                tracing::debug!("Creating session for {}", host_id);
                self.create(host_id, target)
            })
            .clone()
    }

    /// Swap in a fresh session unless the current one is connected or
    /// connecting, which is returned as is. Never inserts: `None` when the
    /// host has no session.
    pub async fn renew(&self, host_id: &HostId, target: ConnectTarget) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let existing = sessions.get(host_id)?;
        if matches!(
            existing.status(),
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        ) {
            return Some(existing.clone());
        }

        let session = self.create(host_id, target);
        if let Some(stale) = sessions.insert(host_id.clone(), session.clone()) {
            // Tunnels and streams of the old session go with it
            tokio::spawn(async move { stale.disconnect().await });
        }
        Some(session)
    }

    pub async fn get(&self, host_id: &HostId) -> Option<Session> {
        self.sessions.read().await.get(host_id).cloned()
    }

    /// Forget the host's session; does not disconnect it
    pub async fn remove(&self, host_id: &HostId) -> Option<Session> {
        self.sessions.write().await.remove(host_id)
    }

    /// Forget `session` only if it is still the host's registered one
    pub async fn remove_if_same(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(session.host_id())
            .is_some_and(|current| current.is_same(session))
        {
            sessions.remove(session.host_id());
            return true;
        }
        false
    }

    pub async fn contains(&self, host_id: &HostId) -> bool {
        self.sessions.read().await.contains_key(host_id)
    }

    /// Status snapshots of every registered session
    pub async fn list(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self
            .sessions
            .read()
            .await
            .values()
            .map(Session::record)
            .collect();
        records.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        records
    }

    /// Disconnect and drop every session
    pub async fn disconnect_all(&self) {
        let sessions: Vec<Session> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        futures::future::join_all(sessions.iter().map(|s| s.disconnect())).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
