use crate::models::{ConnectionEvent, TunnelRule, TunnelStatus};
use crate::services::log_service::StatusReporter;
use crate::services::transport::RemoteConnection;
use crate::utils::error::TunnelError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};

const PUMP_BUFFER: usize = 16 * 1024;

/// Traffic statistics counter
#[derive(Debug, Clone, Default)]
pub struct TrafficCounter {
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
}

impl TrafficCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> (u64, u64) {
        (
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        )
    }
}

/// Handle for a running tunnel. Owns the listener through its accept task.
struct TunnelHandle {
    traffic_counter: TrafficCounter,
    task: Option<JoinHandle<()>>,
}

impl TunnelHandle {
    /// Stop the tunnel and wait until the listening socket is released
    async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct TunnelSetInner {
    /// Present only while the owning session is connected
    connection: Option<Arc<dyn RemoteConnection>>,
    rules: Vec<TunnelRule>,
    running: HashMap<String, TunnelHandle>,
    /// Counters survive a stop so the totals stay visible
    counters: HashMap<String, TrafficCounter>,
}

/// The local port forwards of one session
pub struct TunnelSet {
    inner: Mutex<TunnelSetInner>,
    reporter: StatusReporter,
}

impl TunnelSet {
    pub fn new(reporter: StatusReporter) -> Self {
        Self {
            inner: Mutex::new(TunnelSetInner::default()),
            reporter,
        }
    }

    /// Replace every rule. Running tunnels are stopped; `auto_start` rules
    /// start right away if the session is connected, otherwise on the next
    /// successful connect.
    pub async fn load(&self, rules: Vec<TunnelRule>) {
        let mut inner = self.inner.lock().await;
        self.stop_all(&mut inner).await;

        inner.counters.clear();
        inner.rules = rules;
        self.reporter
            .report(ConnectionEvent::RulesLoaded {
                count: inner.rules.len(),
            })
            .await;

        self.start_auto(&mut inner).await;
    }

    pub async fn rules(&self) -> Vec<TunnelRule> {
        self.inner.lock().await.rules.clone()
    }

    /// Flip one tunnel; returns the new active flag
    pub async fn toggle(&self, tunnel_id: &str) -> Result<bool, TunnelError> {
        let mut inner = self.inner.lock().await;
        if inner.running.contains_key(tunnel_id) {
            self.stop_one(&mut inner, tunnel_id).await;
            Ok(false)
        } else {
            self.start_one(&mut inner, tunnel_id).await?;
            Ok(true)
        }
    }

    pub async fn start(&self, tunnel_id: &str) -> Result<(), TunnelError> {
        let mut inner = self.inner.lock().await;
        if inner.running.contains_key(tunnel_id) {
            return Ok(());
        }
        self.start_one(&mut inner, tunnel_id).await
    }

    pub async fn stop(&self, tunnel_id: &str) -> Result<(), TunnelError> {
        let mut inner = self.inner.lock().await;
        if !inner.rules.iter().any(|r| r.id == tunnel_id) {
            return Err(TunnelError::NotFound(tunnel_id.to_string()));
        }
        self.stop_one(&mut inner, tunnel_id).await;
        Ok(())
    }

    pub async fn status(&self, tunnel_id: &str) -> bool {
        self.inner.lock().await.running.contains_key(tunnel_id)
    }

    pub async fn status_all(&self) -> HashMap<String, bool> {
        let inner = self.inner.lock().await;
        inner
            .rules
            .iter()
            .map(|rule| (rule.id.clone(), inner.running.contains_key(&rule.id)))
            .collect()
    }

    /// Status plus traffic totals for every rule
    pub async fn snapshot(&self) -> Vec<TunnelStatus> {
        let inner = self.inner.lock().await;
        inner
            .rules
            .iter()
            .map(|rule| {
                let (bytes_sent, bytes_received) = inner
                    .counters
                    .get(&rule.id)
                    .map(TrafficCounter::get_stats)
                    .unwrap_or_default();
                TunnelStatus {
                    rule: rule.clone(),
                    active: inner.running.contains_key(&rule.id),
                    bytes_sent,
                    bytes_received,
                }
            })
            .collect()
    }

    /// Bind to a freshly connected session and start `auto_start` rules
    pub(crate) async fn attach(&self, connection: Arc<dyn RemoteConnection>) {
        let mut inner = self.inner.lock().await;
        inner.connection = Some(connection);
        self.start_auto(&mut inner).await;
    }

    /// Force every tunnel inactive and forget the connection
    pub(crate) async fn detach(&self) {
        let mut inner = self.inner.lock().await;
        inner.connection = None;
        self.stop_all(&mut inner).await;
    }

    async fn start_auto(&self, inner: &mut TunnelSetInner) {
        if inner.connection.is_none() {
            return;
        }
        let auto: Vec<String> = inner
            .rules
            .iter()
            .filter(|r| r.auto_start)
            .map(|r| r.id.clone())
            .collect();
        for id in auto {
            // Failures are already reported; the tunnel stays inactive
            let _ = self.start_one(inner, &id).await;
        }
    }

    async fn start_one(
        &self,
        inner: &mut TunnelSetInner,
        tunnel_id: &str,
    ) -> Result<(), TunnelError> {
        let rule = inner
            .rules
            .iter()
            .find(|r| r.id == tunnel_id)
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(tunnel_id.to_string()))?;

        let connection = inner.connection.clone().ok_or(TunnelError::NotConnected)?;

        let port_taken = inner.running.keys().any(|id| {
            inner
                .rules
                .iter()
                .any(|r| &r.id == id && r.local_port == rule.local_port)
        });
        let result = if port_taken {
            Err(TunnelError::Bind {
                port: rule.local_port,
                reason: "already forwarded by another tunnel".to_string(),
            })
        } else {
            TcpListener::bind(rule.local_addr())
                .await
                .map_err(|e| TunnelError::Bind {
                    port: rule.local_port,
                    reason: e.to_string(),
                })
        };

        let listener = match result {
            Ok(listener) => listener,
            Err(e) => {
                self.reporter
                    .report(ConnectionEvent::TunnelFailed {
                        local_port: rule.local_port,
                        reason: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
        };

        tracing::info!("Listening on {}", rule.local_addr());

        let traffic_counter = inner.counters.entry(rule.id.clone()).or_default().clone();
        let task = tokio::spawn(accept_loop(
            listener,
            connection,
            rule.clone(),
            traffic_counter.clone(),
        ));
        inner.running.insert(
            rule.id.clone(),
            TunnelHandle {
                traffic_counter,
                task: Some(task),
            },
        );

        self.reporter
            .report(ConnectionEvent::TunnelStarted {
                local_port: rule.local_port,
                remote: format!("{}:{}", rule.remote_host, rule.remote_port),
            })
            .await;
        Ok(())
    }

    async fn stop_one(&self, inner: &mut TunnelSetInner, tunnel_id: &str) {
        let Some(handle) = inner.running.remove(tunnel_id) else {
            return;
        };
        let (sent, received) = handle.traffic_counter.get_stats();
        handle.stop().await;

        let local_port = inner
            .rules
            .iter()
            .find(|r| r.id == tunnel_id)
            .map(|r| r.local_port)
            .unwrap_or_default();
        tracing::debug!(
            "Tunnel {} stopped after {} bytes sent, {} received",
            tunnel_id,
            sent,
            received
        );
        self.reporter
            .report(ConnectionEvent::TunnelStopped { local_port })
            .await;
    }

    async fn stop_all(&self, inner: &mut TunnelSetInner) {
        let ids: Vec<String> = inner.running.keys().cloned().collect();
        for id in ids {
            self.stop_one(inner, &id).await;
        }
    }
}

/// Accept local clients and pipe each through a direct-tcpip channel.
/// Dropping this future closes the listener and every forwarded connection.
async fn accept_loop(
    listener: TcpListener,
    connection: Arc<dyn RemoteConnection>,
    rule: TunnelRule,
    traffic_counter: TrafficCounter,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((local_stream, peer_addr)) => {
                    tracing::debug!("Accepted connection from {}", peer_addr);
                    connections.spawn(forward_connection(
                        local_stream,
                        connection.clone(),
                        rule.remote_host.clone(),
                        rule.remote_port,
                        traffic_counter.clone(),
                    ));
                }
                Err(e) => {
                    tracing::error!("Accept error on port {}: {}", rule.local_port, e);
                    break;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn forward_connection(
    local_stream: TcpStream,
    connection: Arc<dyn RemoteConnection>,
    remote_host: String,
    remote_port: u16,
    traffic_counter: TrafficCounter,
) {
    let channel = match connection.open_direct_tcpip(&remote_host, remote_port).await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::error!("Forward error: {}", e);
            return;
        }
    };

    let (mut local_read, mut local_write) = local_stream.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(channel);
    let outbound = pump(&mut local_read, &mut remote_write, |n| traffic_counter.add_sent(n));
    let inbound = pump(&mut remote_read, &mut local_write, |n| {
        traffic_counter.add_received(n)
    });

    match tokio::try_join!(outbound, inbound) {
        Ok((sent, received)) => tracing::debug!(
            "Forwarded connection closed: {} bytes out, {} bytes in",
            sent,
            received
        ),
        Err(e) => tracing::debug!("Forwarded connection ended: {}", e),
    }
}

/// Copy until EOF, counting each chunk as soon as it is read so totals stay
/// current for long-lived and aborted connections
async fn pump<R, W>(reader: &mut R, writer: &mut W, count: impl Fn(u64)) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER];
    let mut total = 0;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }
        count(n as u64);
        total += n as u64;
        writer.write_all(&buf[..n]).await?;
    }
}
