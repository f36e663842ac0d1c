use async_trait::async_trait;
use dialoguer::Password;
use rust_i18n::t;
use ssh_console::models::{AuthMethod, Credentials, HostConfig, HostId};
use ssh_console::services::credentials::{CredentialProvider, StaticCredentials};
use ssh_console::utils::error::ConnectError;
use std::collections::HashSet;
use tokio::sync::Mutex;

/// Asks the terminal for a host's secret the first time it is needed and
/// reuses the answer afterwards, so reconnect attempts never block on input
#[derive(Default)]
pub struct PromptingCredentials {
    cache: StaticCredentials,
    answered: Mutex<HashSet<HostId>>,
}

impl PromptingCredentials {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialProvider for PromptingCredentials {
    async fn resolve(&self, host: &HostConfig) -> Result<Credentials, ConnectError> {
        if host.auth.needs_secret() {
            let mut answered = self.answered.lock().await;
            if !answered.contains(&host.id) {
                let prompt = match host.auth {
                    AuthMethod::Password => {
                        t!("cli.password_prompt", host = host.display_name()).to_string()
                    }
                    _ => t!("cli.passphrase_prompt", host = host.display_name()).to_string(),
                };

                let secret = tokio::task::spawn_blocking(move || {
                    Password::new().with_prompt(prompt).interact()
                })
                .await
                .map_err(|e| ConnectError::Aborted(e.to_string()))?
                .map_err(|e| ConnectError::Authentication(e.to_string()))?;

                self.cache.set_secret(host.id.clone(), secret).await;
                answered.insert(host.id.clone());
            }
        }

        self.cache.resolve(host).await
    }
}
