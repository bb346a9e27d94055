//! SSH Client implementation using russh

use std::sync::Arc;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::config::SshConfig;
use super::error::SshError;
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use crate::config::Address;

/// Dials and authenticates one SSH session
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect to `addr` and return the authenticated handle
    pub async fn connect(&self, addr: &Address) -> Result<Handle<ClientHandler>, SshError> {
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .resolve_ipv4()
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.config.keepalive,
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            addr.host().to_string(),
            addr.port(),
            self.config.known_hosts.clone(),
            self.config.strict_host_key_checking,
        );

        let mut handle = tokio::time::timeout(
            self.config.timeout,
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("connection to {} timed out", addr)))?
        .map_err(|e| match e {
            rejected @ SshError::HostKeyRejected { .. } => rejected,
            other => SshError::ConnectionFailed(other.to_string()),
        })?;

        debug!("SSH handshake completed with {}", addr);

        let credentials = &self.config.credentials;
        let key_with_hash = PrivateKeyWithHashAlg::new(credentials.key.clone(), None);
        let authenticated = handle
            .authenticate_publickey(&credentials.username, key_with_hash)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(format!(
                "public key for {} rejected by {}",
                credentials.username, addr
            )));
        }

        info!("SSH authentication successful for {}@{}", credentials.username, addr);
        Ok(handle)
    }
}

/// Client handler for russh callbacks
///
/// Verifies the server's host key against the configured known_hosts
/// store. Without a store every key is accepted.
pub struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Option<Arc<KnownHostsStore>>,
    /// - true: reject unknown keys
    /// - false: accept unknown keys (changed keys are always rejected)
    strict: bool,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        known_hosts: Option<Arc<KnownHostsStore>>,
        strict: bool,
    ) -> Self {
        Self {
            host,
            port,
            known_hosts,
            strict,
        }
    }

    fn check(&self, server_public_key: &PublicKey) -> Result<bool, SshError> {
        let Some(known_hosts) = &self.known_hosts else {
            debug!(
                "No known_hosts configured, accepting key {} for {}:{}",
                KnownHostsStore::fingerprint(server_public_key),
                self.host,
                self.port
            );
            return Ok(true);
        };

        match known_hosts.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } if self.strict => {
                warn!(
                    "Unknown host key for {}:{} (fingerprint: {}). Strict mode enabled, rejecting.",
                    self.host, self.port, fingerprint
                );
                Err(SshError::HostKeyRejected {
                    host: format!("{}:{}", self.host, self.port),
                    reason: format!(
                        "not present in {} (fingerprint {})",
                        known_hosts.path().display(),
                        fingerprint
                    ),
                })
            }
            HostKeyVerification::Unknown { fingerprint } => {
                warn!(
                    "Accepting unknown host key for {}:{} (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                // Always reject changed keys
                Err(SshError::HostKeyRejected {
                    host: format!("{}:{}", self.host, self.port),
                    reason: format!(
                        "key changed! Expected {}, got {}. Possible man-in-the-middle attack",
                        expected_fingerprint, actual_fingerprint
                    ),
                })
            }
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.check(server_public_key)
    }
}
