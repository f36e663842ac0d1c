//! Scripted in-process transport.
//!
//! Stands in for russh when driving the session core without a server:
//! connect outcomes are queued up front, command output is looked up from a
//! script book, and forwarded connections are echoed back.

use super::transport::{ChannelEvent, Connector, ExecChannel, RemoteConnection, TunnelIo};
use crate::models::ConnectTarget;
use crate::utils::error::{ChannelError, ConnectError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecScript {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_status: u32,
    /// Never finish on its own; only cancellation ends it
    pub hang: bool,
}

impl ExecScript {
    pub fn stdout(lines: &[&str]) -> Self {
        Self {
            stdout: lines.iter().map(|l| l.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn failing(exit_status: u32, stderr: &[&str]) -> Self {
        Self {
            stderr: stderr.iter().map(|l| l.to_string()).collect(),
            exit_status,
            ..Self::default()
        }
    }

    pub fn hanging(stdout: &[&str]) -> Self {
        Self {
            hang: true,
            ..Self::stdout(stdout)
        }
    }

    fn events(&self) -> VecDeque<ChannelEvent> {
        let mut events: VecDeque<ChannelEvent> = self
            .stdout
            .iter()
            .map(|line| ChannelEvent::Stdout(format!("{}\n", line).into_bytes()))
            .chain(
                self.stderr
                    .iter()
                    .map(|line| ChannelEvent::Stderr(format!("{}\n", line).into_bytes())),
            )
            .collect();
        if !self.hang {
            events.push_back(ChannelEvent::ExitStatus(self.exit_status));
        }
        events
    }
}

#[derive(Default)]
struct ScriptBook {
    /// First entry whose pattern occurs in the command wins
    entries: Vec<(String, ExecScript)>,
    executed: Vec<String>,
}

impl ScriptBook {
    fn lookup(&self, command: &str) -> ExecScript {
        self.entries
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, script)| script.clone())
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct ConnectorState {
    outcomes: VecDeque<ConnectError>,
    attempts: Vec<(Instant, ConnectTarget)>,
    connections: Vec<Arc<MemoryConnection>>,
}

/// `Connector` whose outcomes are scripted by the caller
#[derive(Default)]
pub struct MemoryConnector {
    state: Mutex<ConnectorState>,
    scripts: Arc<Mutex<ScriptBook>>,
    handshakes: AtomicUsize,
    handshake_delay: Mutex<Duration>,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` handshakes with `error`
    pub fn fail_next(&self, count: usize, error: ConnectError) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state.outcomes.push_back(error.clone());
        }
    }

    /// Make every handshake take `delay`
    pub fn set_handshake_delay(&self, delay: Duration) {
        *lock(&self.handshake_delay) = delay;
    }

    /// Answer commands containing `pattern` with `script`
    pub fn script(&self, pattern: impl Into<String>, script: ExecScript) {
        lock(&self.scripts).entries.push((pattern.into(), script));
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// When each handshake started and with which target
    pub fn attempts(&self) -> Vec<(Instant, ConnectTarget)> {
        lock(&self.state).attempts.clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MemoryConnection>> {
        lock(&self.state).connections.last().cloned()
    }

    /// Every command started on any connection, in order
    pub fn executed(&self) -> Vec<String> {
        lock(&self.scripts).executed.clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> Result<Arc<dyn RemoteConnection>, ConnectError> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        lock(&self.state)
            .attempts
            .push((Instant::now(), target.clone()));

        let delay = *lock(&self.handshake_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if let Some(error) = state.outcomes.pop_front() {
            return Err(error);
        }

        let connection = Arc::new(MemoryConnection {
            closed: AtomicBool::new(false),
            scripts: self.scripts.clone(),
            channels_closed: Arc::new(AtomicUsize::new(0)),
            tunnels_opened: Mutex::new(vec![]),
        });
        state.connections.push(connection.clone());
        Ok(connection)
    }
}

/// In-memory `RemoteConnection`
pub struct MemoryConnection {
    closed: AtomicBool,
    scripts: Arc<Mutex<ScriptBook>>,
    channels_closed: Arc<AtomicUsize>,
    tunnels_opened: Mutex<Vec<(String, u16)>>,
}

impl MemoryConnection {
    /// Simulate the network going away underneath the session
    pub fn drop_link(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// How many exec channels were terminated before finishing on their own
    pub fn channels_closed(&self) -> usize {
        self.channels_closed.load(Ordering::SeqCst)
    }

    pub fn tunnels_opened(&self) -> Vec<(String, u16)> {
        lock(&self.tunnels_opened).clone()
    }
}

#[async_trait]
impl RemoteConnection for MemoryConnection {
    async fn exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Open("connection closed".to_string()));
        }

        let script = {
            let mut book = lock(&self.scripts);
            book.executed.push(command.to_string());
            book.lookup(command)
        };

        Ok(Box::new(MemoryExecChannel {
            events: script.events(),
            hang: script.hang,
            finished: false,
            channels_closed: self.channels_closed.clone(),
        }))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn TunnelIo>, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Open("connection closed".to_string()));
        }
        lock(&self.tunnels_opened).push((host.to_string(), port));

        // The far end echoes everything back
        let (local, remote) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(remote);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(local))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryExecChannel {
    events: VecDeque<ChannelEvent>,
    hang: bool,
    finished: bool,
    channels_closed: Arc<AtomicUsize>,
}

#[async_trait]
impl ExecChannel for MemoryExecChannel {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.finished = true;
        None
    }

    async fn close(&mut self) {
        if !self.finished {
            self.channels_closed.fetch_add(1, Ordering::SeqCst);
        }
        self.finished = true;
    }
}
