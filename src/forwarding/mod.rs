//! Byte forwarding between an accepted client and its remote stream

mod pipe;
mod stats;

pub use pipe::{ConnectionPipe, Direction, PipeOutcome, AUTO_CLOSE_WINDOW};
pub use stats::{ForwardStats, ProcessStats, TunnelStats};
