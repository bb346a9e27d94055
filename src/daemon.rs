//! Daemon orchestrator
//!
//! Owns the host pool and every tunnel. Starts them together, waits for
//! Ctrl-C or a fatal error, then stops every tunnel and waits for all
//! accept loops and connections to drain.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Local};
use futures_util::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigError, TunnelSpec};
use crate::pool::HostPool;
use crate::ssh::{SessionConnector, SshError};
use crate::tunnel::{TunnelContext, TunnelEntry, TunnelError, TunnelSettings};

/// Errors that end the process
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("SSH setup failed: {0}")]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("no tunnel could be started")]
    NothingStarted,
}

pub struct Daemon {
    context: TunnelContext,
    tunnels: Vec<Arc<TunnelEntry>>,
    fail_fast: bool,
    started_at: DateTime<Local>,
}

impl Daemon {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        specs: Vec<TunnelSpec>,
        settings: TunnelSettings,
    ) -> Self {
        let context = TunnelContext::new(Arc::new(HostPool::new(connector)), settings);
        let tunnels = specs
            .into_iter()
            .map(|spec| TunnelEntry::new(spec, context.clone()))
            .collect();
        Self {
            context,
            tunnels,
            fail_fast: false,
            started_at: Local::now(),
        }
    }

    /// Treat any tunnel that fails to bind as fatal
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn tunnels(&self) -> &[Arc<TunnelEntry>] {
        &self.tunnels
    }

    /// Cancelling this token shuts the daemon down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.context.escalation.root().clone()
    }

    /// Start every tunnel concurrently, returns how many are running.
    pub async fn start_all(&self) -> Result<usize, DaemonError> {
        let results = join_all(self.tunnels.iter().map(|tunnel| tunnel.start())).await;

        let mut started = 0;
        for result in results {
            match result {
                Ok(()) => started += 1,
                Err(err) if self.fail_fast => return Err(err.into()),
                Err(err) => warn!("{}, continuing without it", err),
            }
        }
        if started == 0 {
            return Err(DaemonError::NothingStarted);
        }
        Ok(started)
    }

    /// Run until Ctrl-C or a fatal error
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Start every tunnel and serve until `shutdown` resolves
    pub async fn run_until<F: Future<Output = ()>>(&self, shutdown: F) -> Result<(), DaemonError> {
        if let Err(err) = self.start_all().await {
            error!("{}", err);
            self.shutdown().await;
            return Err(err);
        }
        self.serve(shutdown).await
    }

    /// Wait for `shutdown` or a fatal error, then stop everything.
    ///
    /// Returns the fatal error if one was reported.
    pub async fn serve<F: Future<Output = ()>>(&self, shutdown: F) -> Result<(), DaemonError> {
        let root = self.context.escalation.root().clone();
        tokio::select! {
            _ = shutdown => info!("shutdown requested"),
            _ = root.cancelled() => {}
        }

        self.shutdown().await;
        self.log_summary();

        match self.context.escalation.take() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Stop every tunnel and wait for all tasks to finish
    pub async fn shutdown(&self) {
        for tunnel in &self.tunnels {
            tunnel.stop();
        }
        self.context.escalation.root().cancel();
        self.context.tracker.close();
        self.context.tracker.wait().await;
        info!("all tunnels stopped");
    }

    fn log_summary(&self) {
        let uptime = Local::now().signed_duration_since(self.started_at);
        info!(
            "ran for {}s, {} copies still in flight",
            uptime.num_seconds(),
            self.context.process_stats.copies_in_flight()
        );
        for tunnel in &self.tunnels {
            let stats = tunnel.stats();
            info!(
                "tunnel ({}) handled {} connections, {} bytes sent, {} bytes received",
                tunnel.name(),
                stats.connection_count,
                stats.bytes_sent,
                stats.bytes_received
            );
        }
        for host in self.context.pool.hosts() {
            if host.reconnects() > 0 {
                info!("host {} reconnected {} times", host.remote(), host.reconnects());
            }
        }
    }
}
