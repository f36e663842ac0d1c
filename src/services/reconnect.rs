use crate::models::{ConnectionEvent, HostConfig, HostId};
use crate::services::config_service::{AppSettings, HostConfigStore};
use crate::services::credentials::CredentialProvider;
use crate::services::log_service::{LogService, StatusReporter};
use crate::services::session::SessionEvent;
use crate::services::session_registry::SessionRegistry;
use crate::utils::error::ConnectError;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bounded linear backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&AppSettings::default())
    }
}

impl From<&AppSettings> for ReconnectPolicy {
    fn from(settings: &AppSettings) -> Self {
        Self {
            max_attempts: settings.max_reconnect_attempts,
            base_delay: Duration::from_millis(settings.reconnect_base_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_add(1))
    }
}

/// How a reconnect loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// The loop connected the host itself
    Reconnected { attempts: u32 },
    /// Something else connected the host first
    Restored,
    Exhausted,
    Cancelled,
}

enum Attempt {
    Connected,
    Cancelled,
}

struct ActiveLoop {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct CoordinatorState {
    /// Runtime overrides of the persisted auto-reconnect flag
    overrides: HashMap<HostId, bool>,
    active: HashMap<HostId, ActiveLoop>,
    next_generation: u64,
}

/// Re-establishes sessions that dropped unexpectedly
pub struct ReconnectCoordinator {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn HostConfigStore>,
    credentials: Arc<dyn CredentialProvider>,
    log: Arc<LogService>,
    policy: ReconnectPolicy,
    state: Mutex<CoordinatorState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn HostConfigStore>,
        credentials: Arc<dyn CredentialProvider>,
        log: Arc<LogService>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            credentials,
            log,
            policy,
            state: Mutex::new(CoordinatorState::default()),
            listener: Mutex::new(None),
        })
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Start reacting to lost connections published by the registry
    pub async fn start(self: &Arc<Self>) {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return;
        }

        let mut events = self.registry.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        *listener = Some(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Reconnect listener skipped {} session events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                };
                let Some(coordinator) = weak.upgrade() else {
                    return;
                };

                match event {
                    SessionEvent::ConnectionLost { host_id } => {
                        coordinator.trigger(&host_id).await;
                    }
                }
            }
        }));
    }

    /// Force the policy on or off for `host_id`, regardless of its config.
    /// Disabling cancels a running loop.
    pub async fn set_enabled(&self, host_id: &HostId, enabled: bool) {
        let mut state = self.state.lock().await;
        state.overrides.insert(host_id.clone(), enabled);
        if !enabled {
            if let Some(active) = state.active.remove(host_id) {
                active.token.cancel();
            }
        }
    }

    /// Whether an unexpected disconnect of `host_id` would be retried now
    pub async fn is_enabled(&self, host_id: &HostId) -> bool {
        if let Some(enabled) = self.state.lock().await.overrides.get(host_id) {
            return *enabled;
        }
        match self.store.host_config(host_id).await {
            Ok(host) => host.is_some_and(|h| h.auto_reconnect),
            Err(e) => {
                tracing::warn!("Failed to read config of {}: {}", host_id, e);
                false
            }
        }
    }

    pub async fn is_reconnecting(&self, host_id: &HostId) -> bool {
        self.state
            .lock()
            .await
            .active
            .get(host_id)
            .is_some_and(|active| !active.token.is_cancelled())
    }

    /// Begin a reconnect loop for `host_id` if enabled and none is running.
    /// Returns the loop's handle when one was started.
    pub async fn trigger(self: &Arc<Self>, host_id: &HostId) -> Option<JoinHandle<ReconnectOutcome>> {
        if !self.is_enabled(host_id).await {
            tracing::debug!("Auto-reconnect disabled for {}", host_id);
            return None;
        }

        let (generation, token) = {
            let mut state = self.state.lock().await;
            if state
                .active
                .get(host_id)
                .is_some_and(|active| !active.token.is_cancelled())
            {
                return None;
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            let token = CancellationToken::new();
            state.active.insert(
                host_id.clone(),
                ActiveLoop {
                    generation,
                    token: token.clone(),
                },
            );
            (generation, token)
        };

        let coordinator = self.clone();
        let host_id = host_id.clone();
        Some(tokio::spawn(async move {
            let outcome = coordinator.run(&host_id, &token).await;

            let mut state = coordinator.state.lock().await;
            if state
                .active
                .get(&host_id)
                .is_some_and(|active| active.generation == generation)
            {
                state.active.remove(&host_id);
            }
            outcome
        }))
    }

    /// Stop the host's loop, if one is running
    pub async fn cancel(&self, host_id: &HostId) {
        if let Some(active) = self.state.lock().await.active.remove(host_id) {
            active.token.cancel();
        }
    }

    /// Cancel every loop and stop listening
    pub async fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
        for (_, active) in self.state.lock().await.active.drain() {
            active.token.cancel();
        }
    }

    async fn run(&self, host_id: &HostId, token: &CancellationToken) -> ReconnectOutcome {
        let name = match self.store.host_config(host_id).await {
            Ok(Some(host)) => host.name,
            _ => host_id.to_string(),
        };
        let reporter = StatusReporter::new(host_id.clone(), name, self.log.clone());

        // Once the host has a session, losing it means the user let go
        let mut registered = false;
        if let Some(session) = self.registry.get(host_id).await {
            session.mark_reconnecting().await;
            registered = true;
        }
        reporter.report(ConnectionEvent::ReconnectStarted).await;

        let mut attempt = 0;
        while attempt < self.policy.max_attempts {
            if !self.still_enabled(host_id, token).await {
                return self.cancelled(host_id, &reporter).await;
            }

            tokio::select! {
                _ = token.cancelled() => return self.cancelled(host_id, &reporter).await,
                _ = tokio::time::sleep(self.policy.delay(attempt)) => {}
            }
            if !self.still_enabled(host_id, token).await {
                return self.cancelled(host_id, &reporter).await;
            }

            if let Some(session) = self.registry.get(host_id).await {
                if session.status().is_connected() {
                    session.clear_reconnecting().await;
                    reporter.report(ConnectionEvent::ReconnectRestored).await;
                    return ReconnectOutcome::Restored;
                }
            }

            match self.attempt(host_id, token, &mut registered).await {
                Ok(Attempt::Connected) => {
                    let attempts = attempt + 1;
                    reporter
                        .report(ConnectionEvent::Reconnected { attempts })
                        .await;
                    return ReconnectOutcome::Reconnected { attempts };
                }
                Ok(Attempt::Cancelled) => return self.cancelled(host_id, &reporter).await,
                Err(e) => {
                    attempt += 1;
                    tracing::debug!("Reconnect attempt {} for {} failed: {}", attempt, host_id, e);
                    reporter
                        .report(ConnectionEvent::ReconnectAttemptFailed {
                            attempt,
                            max_attempts: self.policy.max_attempts,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        }

        if let Some(session) = self.registry.get(host_id).await {
            session.clear_reconnecting().await;
        }
        reporter
            .report(ConnectionEvent::ReconnectFailed { attempts: attempt })
            .await;
        ReconnectOutcome::Exhausted
    }

    /// Neither cancelled nor switched off in the persisted config
    async fn still_enabled(&self, host_id: &HostId, token: &CancellationToken) -> bool {
        !token.is_cancelled() && self.is_enabled(host_id).await
    }

    /// One connect with the latest persisted config
    async fn attempt(
        &self,
        host_id: &HostId,
        token: &CancellationToken,
        registered: &mut bool,
    ) -> Result<Attempt, ConnectError> {
        let host = self.fetch(host_id).await?;
        let credentials = self.credentials.resolve(&host).await?;
        if token.is_cancelled() {
            return Ok(Attempt::Cancelled);
        }

        let target = host.target(credentials);
        let session = match self.registry.renew(host_id, target.clone()).await {
            Some(session) => session,
            // Removed by a user disconnect since the loop started
            None if *registered => return Ok(Attempt::Cancelled),
            None => self.registry.get_or_create(host_id, target).await,
        };
        *registered = true;

        session.mark_reconnecting().await;
        let result = session.connect().await;

        let still_registered = self
            .registry
            .get(host_id)
            .await
            .is_some_and(|current| current.is_same(&session));
        if token.is_cancelled() || !still_registered {
            self.registry.remove_if_same(&session).await;
            session.disconnect().await;
            return Ok(Attempt::Cancelled);
        }
        result?;
        session.clear_reconnecting().await;

        // Rules may have been edited while the host was down
        let rules = match self.fetch(host_id).await {
            Ok(latest) => latest.tunnels,
            Err(e) => {
                tracing::warn!("Reloading rules of {} failed, using earlier copy: {}", host_id, e);
                host.tunnels
            }
        };
        session.load_port_forwarding_rules(rules).await;
        Ok(Attempt::Connected)
    }

    async fn fetch(&self, host_id: &HostId) -> Result<HostConfig, ConnectError> {
        self.store
            .host_config(host_id)
            .await
            .map_err(|e| ConnectError::Config(e.to_string()))?
            .ok_or_else(|| ConnectError::Config(format!("host {} no longer exists", host_id)))
    }

    async fn cancelled(&self, host_id: &HostId, reporter: &StatusReporter) -> ReconnectOutcome {
        if let Some(session) = self.registry.get(host_id).await {
            session.clear_reconnecting().await;
        }
        reporter.report(ConnectionEvent::ReconnectCancelled).await;
        ReconnectOutcome::Cancelled
    }
}
