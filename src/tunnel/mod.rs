//! Tunnels
//!
//! A [`TunnelEntry`] owns one local entrance: it binds the listener, accepts
//! clients, dials the destination (directly or through a pooled
//! [`Host`](crate::pool::Host)) and pipes bytes until the connection ends
//! or the tunnel is stopped.
//!
//! Cancellation is hierarchical: the daemon's root token is the parent of
//! every tunnel's lifecycle token, which in turn is the parent of every
//! connection's token.

mod entry;
mod error;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::error;

pub use entry::{RunningState, TunnelEntry};
pub use error::TunnelError;

use crate::forwarding::{ProcessStats, AUTO_CLOSE_WINDOW};
use crate::pool::HostPool;

/// Per-connection forwarding settings
#[derive(Debug, Clone, Copy)]
pub struct TunnelSettings {
    /// How long a half-closed connection may linger
    pub auto_close: Duration,
    /// Close a direction after this long without data
    pub idle_timeout: Option<Duration>,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            auto_close: AUTO_CLOSE_WINDOW,
            idle_timeout: None,
        }
    }
}

/// Where tunnels report errors that must end the process.
///
/// The first report is kept and the root token is cancelled, which stops
/// every tunnel.
#[derive(Clone)]
pub struct Escalation {
    first: Arc<Mutex<Option<TunnelError>>>,
    root: CancellationToken,
}

impl Escalation {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            first: Arc::new(Mutex::new(None)),
            root,
        }
    }

    pub fn report(&self, err: TunnelError) {
        error!("{}", err);
        {
            let mut first = self.first.lock();
            if first.is_none() {
                *first = Some(err);
            }
        }
        self.root.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.first.lock().is_some()
    }

    pub fn take(&self) -> Option<TunnelError> {
        self.first.lock().take()
    }

    pub fn root(&self) -> &CancellationToken {
        &self.root
    }
}

/// Everything a tunnel shares with the rest of the daemon
#[derive(Clone)]
pub struct TunnelContext {
    pub pool: Arc<HostPool>,
    pub settings: TunnelSettings,
    pub process_stats: Arc<ProcessStats>,
    pub tracker: TaskTracker,
    pub escalation: Escalation,
}

impl TunnelContext {
    pub fn new(pool: Arc<HostPool>, settings: TunnelSettings) -> Self {
        Self {
            pool,
            settings,
            process_stats: Arc::new(ProcessStats::default()),
            tracker: TaskTracker::new(),
            escalation: Escalation::new(CancellationToken::new()),
        }
    }
}
