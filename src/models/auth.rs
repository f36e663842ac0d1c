use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// SSH authentication method as persisted in a host configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    /// Password authentication (not stored)
    Password,
    /// Public key authentication with an explicit key file
    PublicKey {
        private_key_path: PathBuf,
        passphrase_required: bool,
    },
    /// Try the user's default keys (~/.ssh/id_ed25519, id_rsa, id_ecdsa)
    DefaultKeys {
        #[serde(default)]
        passphrase_required: bool,
    },
}

impl Default for AuthMethod {
    fn default() -> Self {
        Self::Password
    }
}

impl AuthMethod {
    pub fn is_password(&self) -> bool {
        matches!(self, Self::Password)
    }

    pub fn is_public_key(&self) -> bool {
        matches!(self, Self::PublicKey { .. } | Self::DefaultKeys { .. })
    }

    pub fn public_key(path: impl Into<PathBuf>, passphrase_required: bool) -> Self {
        Self::PublicKey {
            private_key_path: path.into(),
            passphrase_required,
        }
    }

    /// Whether resolving credentials for this method needs a secret from the user
    pub fn needs_secret(&self) -> bool {
        match self {
            Self::Password => true,
            Self::PublicKey {
                passphrase_required, ..
            }
            | Self::DefaultKeys {
                passphrase_required,
            } => *passphrase_required,
        }
    }
}

/// Resolved credentials handed to a session at connect time.
#[derive(Clone, PartialEq)]
pub enum Credentials {
    Password(String),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
    DefaultKeys {
        passphrase: Option<String>,
    },
}

impl Credentials {
    /// Combine a persisted auth method with the secret supplied for it
    pub fn from_method(method: &AuthMethod, secret: Option<String>) -> Option<Self> {
        match method {
            AuthMethod::Password => secret.map(Self::Password),
            AuthMethod::PublicKey {
                private_key_path, ..
            } => Some(Self::PrivateKey {
                path: private_key_path.clone(),
                passphrase: secret,
            }),
            AuthMethod::DefaultKeys { .. } => Some(Self::DefaultKeys { passphrase: secret }),
        }
    }
}

// Secrets never reach the logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::PrivateKey { path, passphrase } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
            Self::DefaultKeys { passphrase } => f
                .debug_struct("DefaultKeys")
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_method_serialization() {
        let password_auth = AuthMethod::Password;
        let json = serde_json::to_string(&password_auth).unwrap();
        assert_eq!(json, r#"{"type":"password"}"#);

        let key_auth = AuthMethod::public_key("/path/to/key", false);
        let json = serde_json::to_string(&key_auth).unwrap();
        assert!(json.contains("publickey"));
        assert!(json.contains("/path/to/key"));
    }

    #[test]
    fn test_needs_secret() {
        assert!(AuthMethod::Password.needs_secret());
        assert!(!AuthMethod::public_key("/k", false).needs_secret());
        assert!(AuthMethod::public_key("/k", true).needs_secret());
        assert!(!AuthMethod::DefaultKeys { passphrase_required: false }.needs_secret());
    }

    #[test]
    fn test_password_credentials_require_secret() {
        assert!(Credentials::from_method(&AuthMethod::Password, None).is_none());
        let creds = Credentials::from_method(&AuthMethod::Password, Some("pw".into()));
        assert_eq!(creds, Some(Credentials::Password("pw".into())));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let creds = Credentials::Password("hunter2".into());
        assert!(!format!("{:?}", creds).contains("hunter2"));

        let creds = Credentials::PrivateKey {
            path: PathBuf::from("/k"),
            passphrase: Some("hunter2".into()),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
