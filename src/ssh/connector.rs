//! Session seam between hosts and the SSH transport
//!
//! A [`Host`](crate::pool::Host) only needs to dial a new session to a
//! remote address, open a logical channel over an existing session, and
//! ask that session whether it is still up. These are traits so the pool
//! can be driven by russh in production and by in-memory fakes in tests.

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::client::SshClient;
use super::config::SshConfig;
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController, PingResult};
use crate::config::Address;

/// A bidirectional byte stream that can be forwarded
pub trait ForwardStream: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> ForwardStream for T {}

/// Type-erased forwarding stream
pub type BoxedStream = Pin<Box<dyn ForwardStream>>;

/// Dials multiplexed sessions
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, remote: &Address) -> Result<Box<dyn SecureSession>, SshError>;
}

/// An established multiplexed session
#[async_trait]
pub trait SecureSession: Send + Sync {
    /// Open a logical channel to `destination` as seen from the far side
    async fn open_channel(&self, destination: &Address) -> Result<BoxedStream, SshError>;

    /// Whether the transport still answers. Tells a refused destination
    /// apart from a dead session after a failed open.
    async fn is_alive(&self) -> bool;
}

/// [`SessionConnector`] backed by russh
pub struct SshConnector {
    client: SshClient,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self {
            client: SshClient::new(config),
        }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(&self, remote: &Address) -> Result<Box<dyn SecureSession>, SshError> {
        let handle = self.client.connect(remote).await?;
        Ok(Box::new(spawn_handle_owner_task(handle, remote.to_string())))
    }
}

#[async_trait]
impl SecureSession for HandleController {
    async fn open_channel(&self, destination: &Address) -> Result<BoxedStream, SshError> {
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }
        let channel = self
            .open_direct_tcpip(destination.host(), destination.port() as u32, "127.0.0.1", 0)
            .await?;
        debug!("Opened direct-tcpip channel to {}", destination);
        Ok(Box::pin(channel.into_stream()))
    }

    async fn is_alive(&self) -> bool {
        self.is_connected() && self.ping().await == PingResult::Ok
    }
}
