//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks
//! to it through a [`HandleController`], which sends commands over an
//! mpsc channel.
//!
//! Dropping the last controller does not disconnect the session. The task
//! just releases the handle, and russh keeps the transport up for as long
//! as channels opened on it are still in use. A session that has been
//! replaced after a reconnect therefore lets its live connections finish.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::client::ClientHandler;
use super::error::SshError;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Ping result, separating slow links from dead ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply in time (may be latency, retryable)
    Timeout,
    /// Transport is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel to `host:port` on the far side
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Keepalive round trip
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the sender).
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Wrap an existing command sender. Used by tests; production code
    /// goes through [`spawn_handle_owner_task`].
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Open a direct-tcpip channel
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(SshError::from)
    }

    /// Ping the connection
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the handle and returns a controller for sending commands.
/// `label` only appears in log lines.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let handle = handle;
        debug!("Handle owner task started for {}", label);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        // Channel is dropped here, the server closes it
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::Ping { reply_tx } => {
                    let _ = reply_tx.send(ping(&handle, &label).await);
                }
            }
        }

        // Every controller is gone. Open channels keep the transport alive
        // until they close.
        drop(handle);
        debug!("Handle owner task released session {}", label);
    });

    HandleController { cmd_tx }
}

async fn ping(handle: &Handle<ClientHandler>, label: &str) -> PingResult {
    if handle.is_closed() {
        return PingResult::IoError;
    }
    match tokio::time::timeout(PING_TIMEOUT, handle.send_keepalive(true)).await {
        Ok(Ok(())) => PingResult::Ok,
        Ok(Err(e)) => {
            warn!("Keepalive failed for {}: {:?}", label, e);
            PingResult::IoError
        }
        Err(_) => {
            warn!("Keepalive timeout for {} ({}s)", label, PING_TIMEOUT.as_secs());
            PingResult::Timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_owner_reports_disconnected() {
        let (tx, rx) = mpsc::channel(4);
        let controller = HandleController::new(tx);
        assert!(controller.is_connected());
        drop(rx);

        assert!(!controller.is_connected());
        assert_eq!(controller.ping().await, PingResult::IoError);
        assert!(matches!(
            controller.open_direct_tcpip("127.0.0.1", 80, "127.0.0.1", 0).await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_commands_reach_owner() {
        let (tx, mut rx) = mpsc::channel(4);
        let controller = HandleController::new(tx);

        let owner = tokio::spawn(async move {
            match rx.recv().await {
                Some(HandleCommand::Ping { reply_tx }) => {
                    let _ = reply_tx.send(PingResult::Ok);
                }
                _ => panic!("expected ping"),
            }
            match rx.recv().await {
                Some(HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    reply_tx,
                    ..
                }) => {
                    assert_eq!(host, "10.0.0.9");
                    assert_eq!(port, 443);
                    let _ = reply_tx.send(Err(russh::Error::Disconnect));
                }
                _ => panic!("expected direct-tcpip"),
            }
        });

        assert_eq!(controller.ping().await, PingResult::Ok);
        assert!(controller
            .open_direct_tcpip("10.0.0.9", 443, "127.0.0.1", 0)
            .await
            .is_err());
        owner.await.unwrap();
    }

    #[tokio::test]
    async fn test_owner_dropping_reply_reads_as_dead() {
        let (tx, mut rx) = mpsc::channel(4);
        let controller = HandleController::new(tx);

        // Owner takes the ping and goes away without answering
        let owner = tokio::spawn(async move {
            let cmd = rx.recv().await;
            drop(cmd);
        });
        assert_eq!(controller.ping().await, PingResult::IoError);
        owner.await.unwrap();
    }
}
