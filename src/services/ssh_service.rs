use super::transport::{ChannelEvent, Connector, ExecChannel, RemoteConnection, TunnelIo};
use crate::models::{ConnectTarget, Credentials};
use crate::utils::error::{ChannelError, ConnectError};
use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Keys tried, in order, when a host uses the default identities
const DEFAULT_KEY_FILES: [&str; 3] = ["id_ed25519", "id_rsa", "id_ecdsa"];

/// SSH client session handle
pub type SshSession = Handle<SshClientHandler>;

/// russh-backed `Connector`
#[derive(Debug, Clone)]
pub struct SshService {
    connect_timeout: Duration,
    keepalive_interval: Duration,
}

impl SshService {
    pub fn new(connect_timeout: Duration, keepalive_interval: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive_interval,
        }
    }

    fn client_config(&self) -> Arc<client::Config> {
        // Keepalives make a dead link surface through `is_closed()`
        Arc::new(client::Config {
            keepalive_interval: Some(self.keepalive_interval),
            keepalive_max: 3,
            ..<client::Config as Default>::default()
        })
    }

    async fn open(&self, target: &ConnectTarget) -> Result<SshSession, ConnectError> {
        let handler = if target.verify_host_key {
            SshClientHandler::with_verification(target.host_key_fingerprint.clone())
        } else {
            SshClientHandler::new()
        };

        client::connect(
            self.client_config(),
            (target.host.as_str(), target.port),
            handler,
        )
        .await
        .map_err(|e| match e {
            russh::Error::UnknownKey => {
                ConnectError::Authentication("server host key did not match".to_string())
            }
            other => ConnectError::Network(other.to_string()),
        })
    }

    async fn establish(&self, target: &ConnectTarget) -> Result<SshSession, ConnectError> {
        tracing::info!(
            "Connecting to {} as {}",
            target.address(),
            target.username
        );

        let mut session = self.open(target).await?;

        match &target.credentials {
            Credentials::Password(password) => {
                let auth_res = session
                    .authenticate_password(&target.username, password)
                    .await
                    .map_err(|e| ConnectError::Network(e.to_string()))?;

                if !matches!(auth_res, AuthResult::Success) {
                    return Err(ConnectError::Authentication(
                        "Password authentication failed".to_string(),
                    ));
                }
                tracing::info!("Successfully authenticated with password");
            }
            Credentials::PrivateKey { path, passphrase } => {
                let key = load_key(path, passphrase.as_deref()).await?;
                if !authenticate_key(&mut session, &target.username, key).await? {
                    return Err(ConnectError::Authentication(
                        "Public key authentication failed".to_string(),
                    ));
                }
                tracing::info!("Successfully authenticated with public key");
            }
            Credentials::DefaultKeys { passphrase } => {
                let candidates = default_key_paths();
                if candidates.is_empty() {
                    return Err(ConnectError::Config(
                        "no default SSH keys found in ~/.ssh".to_string(),
                    ));
                }

                let mut authenticated = false;
                for path in candidates {
                    let key = match load_key(&path, passphrase.as_deref()).await {
                        Ok(key) => key,
                        Err(e) => {
                            tracing::debug!("Skipping key {}: {}", path.display(), e);
                            continue;
                        }
                    };
                    if authenticate_key(&mut session, &target.username, key).await? {
                        tracing::info!("Authenticated with {}", path.display());
                        authenticated = true;
                        break;
                    }
                }

                if !authenticated {
                    return Err(ConnectError::Authentication(
                        "none of the default keys were accepted".to_string(),
                    ));
                }
            }
        }

        Ok(session)
    }
}

#[async_trait]
impl Connector for SshService {
    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> Result<Arc<dyn RemoteConnection>, ConnectError> {
        let session = tokio::time::timeout(self.connect_timeout, self.establish(target))
            .await
            .map_err(|_| {
                ConnectError::Network(format!(
                    "connection to {} timed out after {}s",
                    target.address(),
                    self.connect_timeout.as_secs()
                ))
            })??;

        Ok(Arc::new(SshConnection { session }))
    }
}

async fn load_key(path: &Path, passphrase: Option<&str>) -> Result<PrivateKey, ConnectError> {
    let key_data = tokio::fs::read_to_string(path)
        .await
        .map_err(|_| ConnectError::Config(format!("key file not found: {}", path.display())))?;

    let key = PrivateKey::from_openssh(key_data.trim())
        .map_err(|e| ConnectError::Authentication(format!("Failed to load key: {}", e)))?;

    if !key.is_encrypted() {
        return Ok(key);
    }

    let pass = passphrase.ok_or_else(|| {
        ConnectError::Authentication(format!("{} needs a passphrase", path.display()))
    })?;
    key.decrypt(pass.as_bytes())
        .map_err(|e| ConnectError::Authentication(format!("Failed to decrypt key: {}", e)))
}

async fn authenticate_key(
    session: &mut SshSession,
    username: &str,
    key: PrivateKey,
) -> Result<bool, ConnectError> {
    let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);
    let auth_res = session
        .authenticate_publickey(username, key_with_alg)
        .await
        .map_err(|e| ConnectError::Network(e.to_string()))?;

    Ok(matches!(auth_res, AuthResult::Success))
}

fn default_key_paths() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return vec![];
    };
    let ssh_dir = home.join(".ssh");
    DEFAULT_KEY_FILES
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|path| path.exists())
        .collect()
}

/// An authenticated russh session
pub struct SshConnection {
    session: SshSession,
}

#[async_trait]
impl RemoteConnection for SshConnection {
    async fn exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, ChannelError> {
        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(|e| ChannelError::Open(e.to_string()))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| ChannelError::Open(e.to_string()))?;

        Ok(Box::new(SshExecChannel {
            channel,
            exited: false,
        }))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn TunnelIo>, ChannelError> {
        let channel = self
            .session
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| ChannelError::Open(format!("direct-tcpip to {}:{}: {}", host, port, e)))?;

        Ok(Box::new(channel.into_stream()))
    }

    fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    async fn close(&self) {
        if let Err(e) = self
            .session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            tracing::warn!("Disconnect failed: {}", e);
        }
        tracing::info!("Disconnected from SSH server");
    }
}

struct SshExecChannel {
    channel: Channel<Msg>,
    /// The remote process reported its exit or the channel closed
    exited: bool,
}

#[async_trait]
impl ExecChannel for SshExecChannel {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            let Some(msg) = self.channel.wait().await else {
                self.exited = true;
                return None;
            };
            match msg {
                ChannelMsg::Data { ref data } => return Some(ChannelEvent::Stdout(data.to_vec())),
                ChannelMsg::ExtendedData { ref data, .. } => {
                    return Some(ChannelEvent::Stderr(data.to_vec()))
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    self.exited = true;
                    return Some(ChannelEvent::ExitStatus(exit_status));
                }
                // Exit status may still follow EOF
                ChannelMsg::Eof => continue,
                ChannelMsg::Close => {
                    self.exited = true;
                    return None;
                }
                _ => continue,
            }
        }
    }

    async fn close(&mut self) {
        // Without a pty the server keeps the process alive after CHANNEL_CLOSE
        if !self.exited {
            if let Err(e) = self.channel.signal(Sig::TERM).await {
                tracing::debug!("Sending TERM to remote command failed: {}", e);
            }
        }
        if let Err(e) = self.channel.close().await {
            tracing::debug!("Channel close failed: {}", e);
        }
    }
}

/// SSH client handler with host key verification
#[derive(Clone, Default)]
pub struct SshClientHandler {
    /// Whether to verify server host keys
    pub verify_host_keys: bool,
    /// Expected host key fingerprint (SHA256)
    pub expected_fingerprint: Option<String>,
}

impl SshClientHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create handler with host key verification enabled
    pub fn with_verification(expected_fingerprint: Option<String>) -> Self {
        Self {
            verify_host_keys: true,
            expected_fingerprint,
        }
    }

    fn calculate_fingerprint(key: &PublicKey) -> String {
        use russh::keys::ssh_key::HashAlg;
        key.fingerprint(HashAlg::Sha256).to_string()
    }

    fn accepts(&self, fingerprint: &str) -> bool {
        if !self.verify_host_keys {
            tracing::warn!("Host key verification disabled - accepting server key without verification");
            return true;
        }

        match &self.expected_fingerprint {
            Some(expected) if expected == fingerprint => {
                tracing::info!("Server key verified successfully");
                true
            }
            Some(expected) => {
                tracing::error!("Server key mismatch! Expected {}, received {}", expected, fingerprint);
                false
            }
            None => {
                tracing::warn!("First connection to this host, fingerprint {}", fingerprint);
                tracing::warn!("Add it to the host config to enable verification");
                true
            }
        }
    }
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let fingerprint = Self::calculate_fingerprint(server_public_key);
        let accepted = self.accepts(&fingerprint);

        async move {
            tracing::info!("Server key fingerprint: {}", fingerprint);
            if accepted {
                Ok(true)
            } else {
                Err(russh::Error::UnknownKey)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unverified_handler_accepts_any_key() {
        let handler = SshClientHandler::new();
        assert!(handler.accepts("SHA256:anything"));
    }

    #[test]
    fn test_verified_handler_checks_fingerprint() {
        let handler = SshClientHandler::with_verification(Some("SHA256:abc".into()));
        assert!(handler.accepts("SHA256:abc"));
        assert!(!handler.accepts("SHA256:def"));
    }

    #[test]
    fn test_verified_handler_without_fingerprint_accepts_first_key() {
        let handler = SshClientHandler::with_verification(None);
        assert!(handler.accepts("SHA256:abc"));
    }

    #[tokio::test]
    async fn test_missing_key_file_is_config_error() {
        let err = load_key(Path::new("/nonexistent/id_ed25519"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Config(_)));
    }
}
