//! In-memory session fakes and loopback helpers for tests

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::Address;
use crate::ssh::{BoxedStream, SecureSession, SessionConnector, SshError};

/// Connector whose sessions "hop" by dialing the destination directly
#[derive(Default)]
pub(crate) struct FakeConnector {
    connects: AtomicU32,
    fail_next: AtomicU32,
    delay: Duration,
    sessions: Mutex<Vec<Arc<Transport>>>,
}

/// Shared state of one fake session
///
/// `alive` answers liveness checks and gates new channels. Cancelling
/// `closed` tears down every stream opened on the session, the way a
/// dropped SSH transport takes its channels with it.
#[derive(Default)]
struct Transport {
    alive: AtomicBool,
    closed: CancellationToken,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    /// Dial attempts so far, failed ones included
    pub(crate) fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next_connects(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Drop the transport of every session issued so far, closing their
    /// open streams
    pub(crate) fn kill_sessions(&self) {
        for transport in self.sessions.lock().iter() {
            transport.alive.store(false, Ordering::SeqCst);
            transport.closed.cancel();
        }
    }

    /// Make every session issued so far stop answering and refuse new
    /// channels, leaving streams already open untouched
    pub(crate) fn stall_sessions(&self) {
        for transport in self.sessions.lock().iter() {
            transport.alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, remote: &Address) -> Result<Box<dyn SecureSession>, SshError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SshError::ConnectionFailed(format!("{remote} unreachable")));
        }

        let transport = Arc::new(Transport::default());
        transport.alive.store(true, Ordering::SeqCst);
        self.sessions.lock().push(transport.clone());
        Ok(Box::new(FakeSession { transport }))
    }
}

/// Hops by dialing the destination directly. Dropping a session leaves
/// its streams running; only a killed transport closes them.
struct FakeSession {
    transport: Arc<Transport>,
}

#[async_trait]
impl SecureSession for FakeSession {
    async fn open_channel(&self, destination: &Address) -> Result<BoxedStream, SshError> {
        if !self.transport.alive.load(Ordering::SeqCst) {
            return Err(SshError::Disconnected);
        }
        let mut upstream = TcpStream::connect((destination.host(), destination.port()))
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;

        let (channel, mut relay) = tokio::io::duplex(64 * 1024);
        let closed = self.transport.closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::io::copy_bidirectional(&mut relay, &mut upstream) => {}
                _ = closed.cancelled() => {}
            }
        });
        Ok(Box::pin(channel))
    }

    async fn is_alive(&self) -> bool {
        self.transport.alive.load(Ordering::SeqCst)
    }
}

/// Loopback echo server, returns its address
pub(crate) async fn echo_server() -> Address {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    Address::new("127.0.0.1", port)
}

/// Loopback address nothing listens on
pub(crate) async fn closed_port() -> Address {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Address::new("127.0.0.1", port)
}

/// Write `payload` and read the same number of bytes back
pub(crate) async fn round_trip<S>(stream: &mut S, payload: &[u8]) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}
