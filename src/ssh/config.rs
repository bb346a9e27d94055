//! SSH Configuration

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use tracing::debug;

use super::error::SshError;
use super::known_hosts::KnownHostsStore;

/// Signing credential shared by every host session
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub key: Arc<PrivateKey>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, key: PrivateKey) -> Self {
        Self {
            username: username.into(),
            key: Arc::new(key),
        }
    }

    /// Read and decode a private key, decrypting it when a passphrase is given
    pub fn load(
        username: impl Into<String>,
        identity: &Path,
        passphrase: Option<&str>,
    ) -> Result<Self, SshError> {
        let key = russh::keys::load_secret_key(identity, passphrase).map_err(|e| {
            SshError::KeyError(format!(
                "unable to decode identity file ({}): {}",
                identity.display(),
                e
            ))
        })?;
        debug!("Loaded identity {}", identity.display());
        Ok(Self::new(username, key))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// SSH session settings
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub credentials: Credentials,

    /// Connection timeout
    pub timeout: Duration,

    /// Keepalive interval (`None` = disabled)
    pub keepalive: Option<Duration>,

    /// Store used to verify host keys (`None` = accept any key)
    pub known_hosts: Option<Arc<KnownHostsStore>>,

    /// Reject hosts missing from the known_hosts store
    pub strict_host_key_checking: bool,
}

impl SshConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            timeout: Duration::from_secs(default_timeout()),
            keepalive: Some(Duration::from_secs(default_keepalive())),
            known_hosts: None,
            strict_host_key_checking: true,
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    30
}
