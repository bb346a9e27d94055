//! A persistent session to one remote host

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Address;
use crate::ssh::{BoxedStream, SecureSession, SessionConnector, SshError};

/// Host errors
#[derive(Debug, Error)]
pub enum HostError {
    /// The first session to a host could not be established
    #[error("failed to connect to remote host {remote}: {source}")]
    InitialDial {
        remote: Address,
        #[source]
        source: SshError,
    },

    /// No channel could be opened, even after reconnecting once
    #[error("failed to reach {destination} through {remote}: {source}")]
    DialFailure {
        remote: Address,
        destination: Address,
        #[source]
        source: SshError,
    },
}

/// One multiplexed session to a remote address, shared by every tunnel
/// that hops through it.
///
/// The session lives behind the host lock and is replaced in place on
/// reconnect; callers only ever hold the `Host`.
pub struct Host {
    remote: Address,
    connector: Arc<dyn SessionConnector>,
    session: Mutex<Box<dyn SecureSession>>,
    reconnects: AtomicU32,
}

impl Host {
    /// Dial the initial session
    pub async fn connect(
        remote: Address,
        connector: Arc<dyn SessionConnector>,
    ) -> Result<Self, HostError> {
        debug!("connecting to remote server {}", remote);
        let session = match connector.connect(&remote).await {
            Ok(session) => session,
            Err(source) => {
                error!("failed to connect to remote address {}: {}", remote, source);
                return Err(HostError::InitialDial { remote, source });
            }
        };
        info!("session established with {}", remote);

        Ok(Self {
            remote,
            connector,
            session: Mutex::new(session),
            reconnects: AtomicU32::new(0),
        })
    }

    pub fn remote(&self) -> &Address {
        &self.remote
    }

    /// Number of times the session has been re-dialed
    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Open a logical channel to `destination`.
    ///
    /// When an open fails the session is asked whether it is still up. A
    /// live session means the far side refused the destination, which only
    /// fails this call. A dead one is re-dialed once and the open retried
    /// once. The host lock is held throughout, so concurrent failures cause
    /// a single reconnect and queued callers retry against the fresh
    /// session.
    ///
    /// The replaced session is dropped, not closed: connections already
    /// forwarded over it keep running until they end on their own.
    pub async fn open_channel(&self, destination: &Address) -> Result<BoxedStream, HostError> {
        let mut session = self.session.lock().await;

        let first_error = match session.open_channel(destination).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };
        debug!(
            "failed to dial {} through {}: {}",
            destination, self.remote, first_error
        );
        if session.is_alive().await {
            return Err(self.dial_failure(destination, first_error));
        }

        warn!("session to {} lost, reconnecting", self.remote);
        let fresh = self
            .connector
            .connect(&self.remote)
            .await
            .map_err(|source| self.dial_failure(destination, source))?;
        *session = fresh;
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        info!("session re-established with {}", self.remote);

        session
            .open_channel(destination)
            .await
            .map_err(|source| self.dial_failure(destination, source))
    }

    fn dial_failure(&self, destination: &Address, source: SshError) -> HostError {
        error!(
            "failed to reach {} through {}: {}",
            destination, self.remote, source
        );
        HostError::DialFailure {
            remote: self.remote.clone(),
            destination: destination.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{round_trip, FakeConnector};
    use tokio::io::AsyncReadExt;

    fn remote() -> Address {
        Address::new("10.0.0.5", 22)
    }

    #[tokio::test]
    async fn test_initial_dial_failure() {
        let connector = FakeConnector::new();
        connector.fail_next_connects(1);
        let result = Host::connect(remote(), connector.clone()).await;
        assert!(matches!(result, Err(HostError::InitialDial { .. })));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_dead_session_reconnects_once() {
        let connector = FakeConnector::new();
        let host = Host::connect(remote(), connector.clone()).await.unwrap();
        let echo = crate::testing::echo_server().await;

        connector.kill_sessions();
        let stream = host.open_channel(&echo).await;
        assert!(stream.is_ok());
        assert_eq!(connector.connects(), 2);
        assert_eq!(host.reconnects(), 1);

        // Healthy session, no further dials
        host.open_channel(&echo).await.unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_failed_retry_is_not_retried_again() {
        let connector = FakeConnector::new();
        let host = Host::connect(remote(), connector.clone()).await.unwrap();
        let echo = crate::testing::echo_server().await;

        connector.kill_sessions();
        connector.fail_next_connects(1);
        let result = host.open_channel(&echo).await;
        assert!(matches!(result, Err(HostError::DialFailure { .. })));
        assert_eq!(connector.connects(), 2);
        assert_eq!(host.reconnects(), 0);
    }

    #[tokio::test]
    async fn test_refused_destination_keeps_live_session() {
        let connector = FakeConnector::new();
        let host = Host::connect(remote(), connector.clone()).await.unwrap();
        let echo = crate::testing::echo_server().await;
        let mut open = host.open_channel(&echo).await.unwrap();

        // Nothing listens here, but the session itself is fine
        let closed = crate::testing::closed_port().await;
        let result = host.open_channel(&closed).await;
        assert!(matches!(result, Err(HostError::DialFailure { .. })));
        assert_eq!(connector.connects(), 1);
        assert_eq!(host.reconnects(), 0);

        assert_eq!(round_trip(&mut open, b"still here").await, b"still here");
    }

    #[tokio::test]
    async fn test_unreachable_destination_after_reconnect() {
        let connector = FakeConnector::new();
        let host = Host::connect(remote(), connector.clone()).await.unwrap();

        // Dead session and nothing listening: one reconnect, then give up
        connector.kill_sessions();
        let closed = crate::testing::closed_port().await;
        let result = host.open_channel(&closed).await;
        assert!(matches!(result, Err(HostError::DialFailure { .. })));
        assert_eq!(connector.connects(), 2);
        assert_eq!(host.reconnects(), 1);
    }

    #[tokio::test]
    async fn test_connection_on_replaced_session_survives_reconnect() {
        let connector = FakeConnector::new();
        let host = Host::connect(remote(), connector.clone()).await.unwrap();
        let echo = crate::testing::echo_server().await;
        let mut old = host.open_channel(&echo).await.unwrap();

        // Session A stops answering but its open channel still flows
        connector.stall_sessions();
        let mut new = host.open_channel(&echo).await.unwrap();
        assert_eq!(host.reconnects(), 1);

        // Session A has been replaced and dropped by the host
        assert_eq!(round_trip(&mut old, b"from a").await, b"from a");
        assert_eq!(round_trip(&mut new, b"from b").await, b"from b");
    }

    #[tokio::test]
    async fn test_dead_transport_closes_its_streams() {
        let connector = FakeConnector::new();
        let host = Host::connect(remote(), connector.clone()).await.unwrap();
        let echo = crate::testing::echo_server().await;
        let mut open = host.open_channel(&echo).await.unwrap();

        connector.kill_sessions();
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(std::time::Duration::from_secs(2), open.read(&mut buf))
            .await
            .expect("stream outlived its transport");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_concurrent_failures_share_one_reconnect() {
        let connector = FakeConnector::new();
        let host = Arc::new(Host::connect(remote(), connector.clone()).await.unwrap());
        let echo = crate::testing::echo_server().await;

        connector.kill_sessions();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let host = host.clone();
            let echo = echo.clone();
            tasks.push(tokio::spawn(async move { host.open_channel(&echo).await.is_ok() }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(connector.connects(), 2);
        assert_eq!(host.reconnects(), 1);
    }
}
