//! Capability surface the session core needs from an SSH client library.
//!
//! `ssh_service` implements it with russh; `memory_transport` provides a
//! scripted stand-in for embedders and tests.

use crate::models::ConnectTarget;
use crate::utils::error::{ChannelError, ConnectError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Opens authenticated connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> Result<Arc<dyn RemoteConnection>, ConnectError>;
}

/// One authenticated connection to a remote host
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Start `command` on a fresh session channel
    async fn exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, ChannelError>;

    /// Open a direct-tcpip channel to `host:port` as seen from the server
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn TunnelIo>, ChannelError>;

    /// Whether the underlying transport has gone away
    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// Output of a running remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
}

#[async_trait]
pub trait ExecChannel: Send {
    /// Next piece of output; `None` once the channel has ended
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    /// Terminate the remote process and close the channel
    async fn close(&mut self);
}

/// Byte stream of a forwarded connection
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}
