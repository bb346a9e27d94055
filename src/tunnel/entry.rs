//! Tunnel entry lifecycle

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{TunnelContext, TunnelError};
use crate::config::TunnelSpec;
use crate::forwarding::{ConnectionPipe, ForwardStats, TunnelStats};
use crate::ssh::BoxedStream;

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunningState::Stopped => "stopped",
            RunningState::Starting => "starting",
            RunningState::Started => "started",
            RunningState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// One local entrance and the connections accepted on it
pub struct TunnelEntry {
    spec: TunnelSpec,
    context: TunnelContext,
    stats: Arc<TunnelStats>,
    state: watch::Sender<RunningState>,
    /// Lifecycle token, present from start until the watcher has run
    lifecycle: Mutex<Option<CancellationToken>>,
    /// Live connections by id; cancelling a token closes its sockets
    connections: Mutex<HashMap<u64, CancellationToken>>,
    bound: Mutex<Option<SocketAddr>>,
}

impl TunnelEntry {
    pub fn new(spec: TunnelSpec, context: TunnelContext) -> Arc<Self> {
        let (state, _) = watch::channel(RunningState::Stopped);
        Arc::new(Self {
            spec,
            context,
            stats: Arc::new(TunnelStats::default()),
            state,
            lifecycle: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            bound: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> RunningState {
        *self.state.borrow()
    }

    /// Address the entrance is listening on while started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.snapshot()
    }

    pub fn live_connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Wait until the tunnel has fully stopped
    pub async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == RunningState::Stopped).await;
    }

    /// Open the entrance and start accepting. Does nothing unless stopped.
    pub async fn start(self: &Arc<Self>) -> Result<(), TunnelError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == RunningState::Stopped {
                *state = RunningState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!("tunnel ({}) is already {}", self.spec.name, self.state());
            return Ok(());
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(source) => {
                self.state.send_replace(RunningState::Stopped);
                let err = TunnelError::Bind {
                    name: self.spec.name.clone(),
                    local: self.spec.local.clone(),
                    source,
                };
                error!("{}", err);
                return Err(err);
            }
        };
        let bound = listener.local_addr().ok();
        *self.bound.lock() = bound;

        let token = self.context.escalation.root().child_token();
        *self.lifecycle.lock() = Some(token.clone());
        self.state.send_replace(RunningState::Started);

        match &self.spec.host {
            Some(host) => info!(
                "tunnel ({}) entrance opened on {}, forwarding to {} via {}",
                self.spec.name,
                bound.map_or_else(|| self.spec.local.to_string(), |a| a.to_string()),
                self.spec.remote,
                host.address
            ),
            None => info!(
                "tunnel ({}) entrance opened on {}, forwarding to {}",
                self.spec.name,
                bound.map_or_else(|| self.spec.local.to_string(), |a| a.to_string()),
                self.spec.remote
            ),
        }

        let watcher = {
            let entry = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                entry.close_all();
            })
        };
        let entry = self.clone();
        self.context
            .tracker
            .spawn(async move { entry.accept_loop(listener, token, watcher).await });
        Ok(())
    }

    /// Stop accepting and close every live connection. Does nothing unless
    /// the tunnel has a lifecycle to cancel.
    ///
    /// Only a started tunnel moves to stopping. A token taken just before
    /// the accept loop finished is still cancelled, but cannot pull a
    /// stopped tunnel back to stopping.
    pub fn stop(&self) {
        let Some(token) = self.lifecycle.lock().clone() else {
            debug!("tunnel ({}) is not running", self.spec.name);
            return;
        };
        let stopping = self.state.send_if_modified(|state| {
            if *state == RunningState::Started {
                *state = RunningState::Stopping;
                true
            } else {
                false
            }
        });
        if stopping {
            info!("tunnel ({}) stopping", self.spec.name);
        }
        token.cancel();
    }

    async fn bind(&self) -> io::Result<TcpListener> {
        let addr = self
            .spec
            .local
            .resolve_ipv4()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        TcpListener::bind(addr).await
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        token: CancellationToken,
        watcher: JoinHandle<()>,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer, &token),
                    Err(source) => {
                        let err = TunnelError::Accept {
                            name: self.spec.name.clone(),
                            source,
                        };
                        error!("{}", err);
                        break;
                    }
                },
            }
        }

        drop(listener);
        self.state.send_replace(RunningState::Stopping);
        token.cancel();
        let _ = watcher.await;

        *self.bound.lock() = None;
        self.state.send_replace(RunningState::Stopped);
        info!(
            "tunnel ({}) stopped listening on {}",
            self.spec.name, self.spec.local
        );
    }

    /// Runs once the lifecycle token is cancelled
    fn close_all(&self) {
        let live: Vec<(u64, CancellationToken)> = self.connections.lock().drain().collect();
        for (id, conn) in live {
            trace!("tunnel ({}) id:{} closing", self.spec.name, id);
            conn.cancel();
        }
        self.lifecycle.lock().take();
    }

    /// Track a new connection. Returns its token, or `None` once the tunnel
    /// is shutting down.
    fn add_connection(&self, id: u64, lifetime: &CancellationToken) -> Option<CancellationToken> {
        let mut connections = self.connections.lock();
        if lifetime.is_cancelled() {
            return None;
        }
        let conn = lifetime.child_token();
        connections.insert(id, conn.clone());
        Some(conn)
    }

    /// Close a connection and forget it
    fn remove_connection(&self, id: u64) {
        if let Some(conn) = self.connections.lock().remove(&id) {
            conn.cancel();
        }
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, lifetime: &CancellationToken) {
        let id = self.context.process_stats.next_connection_id();
        let Some(conn) = self.add_connection(id, lifetime) else {
            return;
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {}", e);
        }

        let active = self.stats.connected();
        debug!(
            "tunnel ({}) id:{} accepted {} ({} active)",
            self.spec.name, id, peer, active
        );

        let entry = self.clone();
        self.context.tracker.spawn(async move {
            entry.forward(id, stream, conn).await;
            entry.remove_connection(id);
            let active = entry.stats.disconnected();
            debug!(
                "tunnel ({}) id:{} closed ({} active)",
                entry.spec.name, id, active
            );
        });
    }

    async fn forward(&self, id: u64, local: TcpStream, conn: CancellationToken) {
        let dialed = tokio::select! {
            dialed = self.dial() => dialed,
            _ = conn.cancelled() => return,
        };
        let remote = match dialed {
            Ok(remote) => remote,
            Err(err) if err.is_fatal() => {
                self.context.escalation.report(err);
                return;
            }
            Err(err) => {
                warn!("tunnel ({}) id:{} {}", self.spec.name, id, err);
                return;
            }
        };

        let settings = self.context.settings;
        let outcome = ConnectionPipe::new(
            id,
            self.spec.name.as_str(),
            self.stats.clone(),
            self.context.process_stats.clone(),
        )
        .with_auto_close(settings.auto_close)
        .with_idle_timeout(settings.idle_timeout)
        .run(local, remote, conn)
        .await;
        trace!("tunnel ({}) id:{} pipe ended: {:?}", self.spec.name, id, outcome);
    }

    async fn dial(&self) -> Result<BoxedStream, TunnelError> {
        match &self.spec.host {
            None => {
                let remote = &self.spec.remote;
                let stream = TcpStream::connect((remote.host(), remote.port()))
                    .await
                    .map_err(|source| TunnelError::DirectDial {
                        destination: remote.clone(),
                        source,
                    })?;
                let _ = stream.set_nodelay(true);
                Ok(Box::pin(stream))
            }
            Some(host) => {
                let host = self.context.pool.get_or_create(&host.address).await?;
                Ok(host.open_channel(&self.spec.remote).await?)
            }
        }
    }
}
