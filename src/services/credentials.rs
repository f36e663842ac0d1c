use crate::models::{Credentials, HostConfig, HostId};
use crate::utils::error::ConnectError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Turns a host's auth method into usable credentials.
///
/// Called on every connect, including each reconnect attempt, so
/// implementations must not block on user input more than once per host.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, host: &HostConfig) -> Result<Credentials, ConnectError>;
}

/// Secrets supplied up front, keyed by host
#[derive(Default)]
pub struct StaticCredentials {
    secrets: RwLock<HashMap<HostId, String>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, host_id: HostId, secret: impl Into<String>) -> Self {
        self.secrets.get_mut().insert(host_id, secret.into());
        self
    }

    pub async fn set_secret(&self, host_id: HostId, secret: impl Into<String>) {
        self.secrets.write().await.insert(host_id, secret.into());
    }

    pub async fn forget(&self, host_id: &HostId) {
        self.secrets.write().await.remove(host_id);
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn resolve(&self, host: &HostConfig) -> Result<Credentials, ConnectError> {
        let secret = if host.auth.needs_secret() {
            self.secrets.read().await.get(&host.id).cloned()
        } else {
            None
        };

        Credentials::from_method(&host.auth, secret).ok_or_else(|| {
            ConnectError::Authentication(format!("no password available for {}", host.name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuthMethod;

    #[tokio::test]
    async fn test_password_host_without_secret_fails() {
        let creds = StaticCredentials::new();
        let host = HostConfig::new("web", "example.com", "root");
        let err = creds.resolve(&host).await.unwrap_err();
        assert!(err.is_authentication());
    }

    #[tokio::test]
    async fn test_password_host_with_secret() {
        let creds = StaticCredentials::new();
        let host = HostConfig::new("web", "example.com", "root");
        creds.set_secret(host.id.clone(), "pw").await;

        assert_eq!(
            creds.resolve(&host).await.unwrap(),
            Credentials::Password("pw".into())
        );
    }

    #[tokio::test]
    async fn test_key_host_needs_no_secret() {
        let creds = StaticCredentials::new();
        let host = HostConfig::new("web", "example.com", "root")
            .with_auth(AuthMethod::public_key("/home/me/.ssh/id_ed25519", false));

        assert!(matches!(
            creds.resolve(&host).await.unwrap(),
            Credentials::PrivateKey {
                passphrase: None,
                ..
            }
        ));
    }
}
