//! Connection pipe
//!
//! Copies bytes local -> remote and remote -> local until both directions
//! have ended. When one direction ends first the other is given a bounded
//! window to finish (remote shells keep flushing after the client's EOF);
//! if it has not finished when the window closes, both streams are dropped.
//!
//! The optional idle timeout covers the connection as a whole: traffic in
//! either direction keeps it open, so a one-way download never trips it.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::stats::{ProcessStats, TunnelStats};

/// Default time a half-closed connection may linger
pub const AUTO_CLOSE_WINDOW: Duration = Duration::from_secs(30);

const BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// local -> remote
    Transmit,
    /// remote -> local
    Receive,
}

impl Direction {
    fn other(self) -> Self {
        match self {
            Direction::Transmit => Direction::Receive,
            Direction::Receive => Direction::Transmit,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Transmit => f.write_str("transmit"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// How a pipe ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOutcome {
    /// Both directions finished on their own
    Drained,
    /// One direction was still open when the auto-close window ran out
    AutoClosed,
    /// Neither direction carried data for the idle timeout
    Idle,
    /// The owning tunnel or connection was cancelled
    Terminated,
}

/// Which directions have finished
#[derive(Debug, Default, Clone, Copy)]
struct Completion {
    transmit: bool,
    receive: bool,
}

impl Completion {
    fn finish(&mut self, direction: Direction) {
        match direction {
            Direction::Transmit => self.transmit = true,
            Direction::Receive => self.receive = true,
        }
    }

    fn is_finished(&self, direction: Direction) -> bool {
        match direction {
            Direction::Transmit => self.transmit,
            Direction::Receive => self.receive,
        }
    }
}

/// Last time either direction carried data
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Decrements the in-flight copy counter however the copy ends
struct InFlight<'a>(&'a ProcessStats);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.copy_finished();
    }
}

/// Bidirectional forwarder for one accepted connection
pub struct ConnectionPipe {
    id: u64,
    tunnel: String,
    auto_close: Duration,
    idle_timeout: Option<Duration>,
    tunnel_stats: Arc<TunnelStats>,
    process_stats: Arc<ProcessStats>,
}

impl ConnectionPipe {
    pub fn new(
        id: u64,
        tunnel: impl Into<String>,
        tunnel_stats: Arc<TunnelStats>,
        process_stats: Arc<ProcessStats>,
    ) -> Self {
        Self {
            id,
            tunnel: tunnel.into(),
            auto_close: AUTO_CLOSE_WINDOW,
            idle_timeout: None,
            tunnel_stats,
            process_stats,
        }
    }

    pub fn with_auto_close(mut self, window: Duration) -> Self {
        self.auto_close = window;
        self
    }

    /// Close the connection after this long without data in either direction
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Forward until both directions end, the auto-closer or idle timeout
    /// fires, or `lifetime` is cancelled. Both streams are closed on return.
    pub async fn run<L, R>(self, local: L, remote: R, lifetime: CancellationToken) -> PipeOutcome
    where
        L: AsyncRead + AsyncWrite + Send,
        R: AsyncRead + AsyncWrite + Send,
    {
        let (local_read, local_write) = tokio::io::split(local);
        let (remote_read, remote_write) = tokio::io::split(remote);

        let activity = Activity::new();
        let transmit = self.copy(Direction::Transmit, local_read, remote_write, &activity);
        let receive = self.copy(Direction::Receive, remote_read, local_write, &activity);
        let idle = self.idle_watch(&activity);
        tokio::pin!(transmit, receive, idle);

        let mut completion = Completion::default();
        let first = tokio::select! {
            _ = &mut transmit => Direction::Transmit,
            _ = &mut receive => Direction::Receive,
            _ = &mut idle => return PipeOutcome::Idle,
            _ = lifetime.cancelled() => {
                debug!("tunnel ({}) id:{} terminated", self.tunnel, self.id);
                return PipeOutcome::Terminated;
            }
        };
        completion.finish(first);

        trace!(
            "tunnel ({}) id:{} c:{} auto-closer initiated",
            self.tunnel,
            self.id,
            self.process_stats.copies_in_flight()
        );
        let remaining = first.other();
        let outcome = tokio::select! {
            _ = async {
                match remaining {
                    Direction::Transmit => (&mut transmit).await,
                    Direction::Receive => (&mut receive).await,
                }
            } => {
                completion.finish(remaining);
                PipeOutcome::Drained
            }
            _ = tokio::time::sleep(self.auto_close) => PipeOutcome::AutoClosed,
            _ = &mut idle => PipeOutcome::Idle,
            _ = lifetime.cancelled() => PipeOutcome::Terminated,
        };

        match outcome {
            PipeOutcome::AutoClosed => debug!(
                "tunnel ({}) id:{} auto-closer triggered, {} still open",
                self.tunnel, self.id, remaining
            ),
            _ => trace!(
                "tunnel ({}) id:{} auto-closer cancelled (transmit done: {}, receive done: {})",
                self.tunnel,
                self.id,
                completion.is_finished(Direction::Transmit),
                completion.is_finished(Direction::Receive)
            ),
        }
        outcome
    }

    /// Resolves once neither direction has carried data for the idle
    /// timeout, never when there is none
    async fn idle_watch(&self, activity: &Activity) {
        let Some(idle) = self.idle_timeout else {
            return std::future::pending().await;
        };
        loop {
            let deadline = activity.last() + idle;
            if Instant::now() >= deadline {
                debug!(
                    "tunnel ({}) id:{} idle for {}s, closing",
                    self.tunnel,
                    self.id,
                    idle.as_secs()
                );
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }

    async fn copy<Rd, Wr>(
        &self,
        direction: Direction,
        mut reader: Rd,
        mut writer: Wr,
        activity: &Activity,
    ) where
        Rd: AsyncRead + Unpin,
        Wr: AsyncWrite + Unpin,
    {
        self.process_stats.copy_started();
        let _in_flight = InFlight(&self.process_stats);

        let result = self.pump(direction, &mut reader, &mut writer, activity).await;

        // Pass the EOF on; the peer may still answer in the other direction
        let _ = writer.shutdown().await;

        trace!(
            "tunnel ({}) id:{} c:{} {} tunnel closed",
            self.tunnel,
            self.id,
            self.process_stats.copies_in_flight() - 1,
            direction
        );
        if let Err(e) = result {
            trace!("{} encountered a closed tunnel: {}", direction, e);
        }
    }

    /// Copy until EOF or error
    async fn pump<Rd, Wr>(
        &self,
        direction: Direction,
        reader: &mut Rd,
        writer: &mut Wr,
        activity: &Activity,
    ) -> io::Result<()>
    where
        Rd: AsyncRead + Unpin,
        Wr: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                return Ok(());
            }
            activity.touch();
            writer.write_all(&buf[..read]).await?;
            self.tunnel_stats.record(direction, read);
        }
    }
}
