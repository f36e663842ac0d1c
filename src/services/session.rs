use crate::models::{ConnectTarget, ConnectionEvent, ConnectionStatus, HostId, SessionRecord, TunnelRule};
use crate::services::config_service::AppSettings;
use crate::services::exec_service::{StreamExecutor, StreamLimits, StreamTracker};
use crate::services::log_service::{LogService, StatusReporter};
use crate::services::log_tailer::LogTailer;
use crate::services::transport::{Connector, RemoteConnection};
use crate::services::tunnel_service::TunnelSet;
use crate::utils::error::{ConnectError, ExecError, TailError};
use chrono::Utc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Timing knobs for one session
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub health_check_interval: Duration,
    pub cleanup_timeout: Duration,
    pub command_timeout: Duration,
    pub tail_history_lines: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&AppSettings::default())
    }
}

impl From<&AppSettings> for SessionSettings {
    fn from(settings: &AppSettings) -> Self {
        Self {
            health_check_interval: Duration::from_secs(settings.health_check_interval_seconds),
            cleanup_timeout: Duration::from_secs(settings.cleanup_timeout_seconds),
            command_timeout: Duration::from_secs(settings.command_timeout_seconds),
            tail_history_lines: settings.tail_history_lines,
        }
    }
}

/// Lifecycle notifications published to the registry's subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A connected session lost its transport without being asked to
    ConnectionLost { host_id: HostId },
}

type HandshakeResult = Option<Result<(), ConnectError>>;

struct SessionInner {
    target: ConnectTarget,
    connection: Option<Arc<dyn RemoteConnection>>,
    /// Shared by every caller waiting on the current handshake
    in_flight: Option<watch::Receiver<HandshakeResult>>,
    /// Bumped by every teardown so late handshakes and monitors know they are stale
    epoch: u64,
    monitor: Option<CancellationToken>,
    /// Set while the reconnect loop owns this host
    reconnecting: bool,
}

struct SessionShared {
    host_id: HostId,
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    reporter: StatusReporter,
    record: watch::Sender<SessionRecord>,
    inner: Mutex<SessionInner>,
    tunnels: TunnelSet,
    tracker: Arc<StreamTracker>,
    events: broadcast::Sender<SessionEvent>,
}

/// One host's connection and everything riding on it.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host_id", &self.shared.host_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        host_id: HostId,
        target: ConnectTarget,
        connector: Arc<dyn Connector>,
        settings: SessionSettings,
        log: Arc<LogService>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let reporter = StatusReporter::new(host_id.clone(), target.name.clone(), log);
        let (record, _) = watch::channel(SessionRecord::new(host_id.clone()));

        Self {
            shared: Arc::new(SessionShared {
                host_id,
                connector,
                settings,
                tunnels: TunnelSet::new(reporter.clone()),
                reporter,
                record,
                inner: Mutex::new(SessionInner {
                    target,
                    connection: None,
                    in_flight: None,
                    epoch: 0,
                    monitor: None,
                    reconnecting: false,
                }),
                tracker: Arc::new(StreamTracker::new()),
                events,
            }),
        }
    }

    pub fn host_id(&self) -> &HostId {
        &self.shared.host_id
    }

    /// Current state snapshot
    pub fn record(&self) -> SessionRecord {
        self.shared.record.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.record.borrow().status
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionRecord> {
        self.shared.record.subscribe()
    }

    pub fn is_same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Connect, or join the handshake already in progress.
    /// Succeeds immediately when already connected.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let mut rx = {
            let mut inner = self.shared.inner.lock().await;
            if inner.connection.is_some() {
                return Ok(());
            }

            match &inner.in_flight {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inner.in_flight = Some(rx.clone());

                    let quiet = inner.reconnecting;
                    self.shared.record.send_modify(|record| {
                        record.status = ConnectionStatus::Connecting;
                    });
                    if !quiet {
                        self.shared.reporter.report(ConnectionEvent::Connecting).await;
                    }

                    tokio::spawn(handshake(
                        self.shared.clone(),
                        inner.target.clone(),
                        inner.epoch,
                        tx,
                    ));
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(result) => result
                .clone()
                .unwrap_or_else(|| Err(ConnectError::Aborted("no handshake result".to_string()))),
            Err(_) => Err(ConnectError::Aborted(
                "handshake ended without a result".to_string(),
            )),
        };
        outcome
    }

    /// Tear everything down: streams, tunnels, then the connection.
    /// Never fails; cleanup problems are logged.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        inner.epoch += 1;
        inner.reconnecting = false;
        if let Some(monitor) = inner.monitor.take() {
            monitor.cancel();
        }
        let was_connecting = inner.in_flight.take().is_some();
        let connection = inner.connection.take();
        let was_active = was_connecting || connection.is_some();

        shared.tracker.stop_all(shared.settings.cleanup_timeout).await;
        shared.tunnels.detach().await;

        if let Some(connection) = connection {
            if tokio::time::timeout(shared.settings.cleanup_timeout, connection.close())
                .await
                .is_err()
            {
                tracing::warn!("Closing connection to {} timed out", shared.host_id);
            }
        }

        shared.record.send_modify(|record| {
            record.status = ConnectionStatus::Disconnected;
            record.connected_at = None;
        });
        if was_active {
            shared.reporter.report(ConnectionEvent::Disconnected).await;
        }
    }

    /// Replace the tunnel rules; `auto_start` rules start now if connected,
    /// otherwise on the next successful connect
    pub async fn load_port_forwarding_rules(&self, rules: Vec<TunnelRule>) {
        self.shared.tunnels.load(rules).await;
    }

    pub fn tunnels(&self) -> &TunnelSet {
        &self.shared.tunnels
    }

    /// Cancel every executor and tailer spawned from this session. Executors
    /// obtained before the call refuse new runs; ask for a fresh one.
    pub async fn stop_current_streams(&self) {
        self.shared
            .tracker
            .stop_all(self.shared.settings.cleanup_timeout)
            .await;
    }

    /// Executors and tailers still running
    pub fn live_streams(&self) -> usize {
        self.shared.tracker.live()
    }

    /// The live connection, for collaborators such as file transfer
    pub async fn connection(&self) -> Option<Arc<dyn RemoteConnection>> {
        self.shared.inner.lock().await.connection.clone()
    }

    pub async fn stream_executor(&self) -> Result<StreamExecutor, ExecError> {
        let connection = self.connection().await.ok_or(ExecError::NotConnected)?;
        Ok(StreamExecutor::new(
            connection,
            self.shared.tracker.clone(),
            self.limits(),
            self.shared.reporter.clone(),
        ))
    }

    pub async fn log_tailer(&self) -> Result<LogTailer, TailError> {
        let connection = self.connection().await.ok_or(TailError::NotConnected)?;
        Ok(LogTailer::new(
            connection,
            self.shared.tracker.clone(),
            self.limits(),
            self.shared.settings.tail_history_lines,
            self.shared.reporter.clone(),
        ))
    }

    fn limits(&self) -> StreamLimits {
        StreamLimits {
            command_timeout: self.shared.settings.command_timeout,
            cleanup_timeout: self.shared.settings.cleanup_timeout,
        }
    }

    /// Use `target` for the next connect
    pub async fn set_target(&self, target: ConnectTarget) {
        self.shared.inner.lock().await.target = target;
    }

    /// Hand the host to the reconnect loop
    pub(crate) async fn mark_reconnecting(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.reconnecting = true;
        if inner.connection.is_none() && inner.in_flight.is_none() {
            self.shared.record.send_modify(|record| {
                record.status = ConnectionStatus::Reconnecting;
            });
        }
    }

    pub(crate) async fn clear_reconnecting(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.reconnecting = false;
        self.shared.record.send_if_modified(|record| {
            if record.status == ConnectionStatus::Reconnecting {
                record.status = ConnectionStatus::Disconnected;
                true
            } else {
                false
            }
        });
    }
}

impl SessionShared {
    async fn finish_connect(
        self: &Arc<Self>,
        epoch: u64,
        result: Result<Arc<dyn RemoteConnection>, ConnectError>,
    ) -> Result<(), ConnectError> {
        let mut inner = self.inner.lock().await;

        if inner.epoch != epoch {
            // disconnect() ran while the handshake was in flight
            if let Ok(connection) = result {
                let _ = tokio::time::timeout(self.settings.cleanup_timeout, connection.close()).await;
            }
            return Err(ConnectError::Aborted(
                "session was disconnected while connecting".to_string(),
            ));
        }
        inner.in_flight = None;

        match result {
            Ok(connection) => {
                inner.connection = Some(connection.clone());
                self.record.send_modify(|record| {
                    record.status = ConnectionStatus::Connected;
                    record.connected_at = Some(Utc::now());
                    record.last_error = None;
                });
                if !inner.reconnecting {
                    self.reporter.report(ConnectionEvent::Connected).await;
                }

                self.tunnels.attach(connection.clone()).await;

                let token = CancellationToken::new();
                tokio::spawn(monitor(
                    Arc::downgrade(self),
                    connection,
                    inner.epoch,
                    token.clone(),
                    self.settings.health_check_interval,
                ));
                inner.monitor = Some(token);
                Ok(())
            }
            Err(e) => {
                let status = if inner.reconnecting {
                    ConnectionStatus::Reconnecting
                } else {
                    ConnectionStatus::Disconnected
                };
                self.record.send_modify(|record| {
                    record.status = status;
                    record.connected_at = None;
                    record.last_error = Some(e.to_string());
                });
                if !inner.reconnecting {
                    self.reporter
                        .report(ConnectionEvent::ConnectionFailed {
                            reason: e.to_string(),
                        })
                        .await;
                }
                Err(e)
            }
        }
    }

    /// The transport died under a connected session
    async fn connection_lost(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || inner.connection.is_none() {
            return;
        }
        inner.epoch += 1;
        inner.monitor = None;
        let connection = inner.connection.take();

        self.tracker.stop_all(self.settings.cleanup_timeout).await;
        self.tunnels.detach().await;
        if let Some(connection) = connection {
            let _ = tokio::time::timeout(self.settings.cleanup_timeout, connection.close()).await;
        }

        self.record.send_modify(|record| {
            record.status = ConnectionStatus::Disconnected;
            record.connected_at = None;
            record.last_error = Some("connection lost".to_string());
        });
        self.reporter.report(ConnectionEvent::ConnectionLost).await;

        // Nobody listening is fine
        let _ = self.events.send(SessionEvent::ConnectionLost {
            host_id: self.host_id.clone(),
        });
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        if let Some(monitor) = self.inner.get_mut().monitor.take() {
            monitor.cancel();
        }
    }
}

async fn handshake(
    shared: Arc<SessionShared>,
    target: ConnectTarget,
    epoch: u64,
    tx: watch::Sender<HandshakeResult>,
) {
    let result = shared.connector.connect(&target).await;
    let outcome = shared.finish_connect(epoch, result).await;
    if let Err(e) = &outcome {
        tracing::debug!("Connect to {} failed: {}", target.address(), e);
    }
    let _ = tx.send(Some(outcome));
}

/// Poll the transport until it closes or the session stops watching
async fn monitor(
    shared: Weak<SessionShared>,
    connection: Arc<dyn RemoteConnection>,
    epoch: u64,
    token: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if connection.is_closed() {
            if let Some(shared) = shared.upgrade() {
                shared.connection_lost(epoch).await;
            }
            return;
        }
    }
}
