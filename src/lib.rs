//! auto-ssh
//!
//! A daemon that opens local TCP entrances and forwards every accepted
//! connection to a destination, either directly or through a pooled,
//! auto-reconnecting SSH session to a remote host.
//!
//! - [`config`]: YAML/command-line configuration and tunnel validation
//! - [`ssh`]: russh transport, known_hosts verification, session seam
//! - [`pool`]: one shared [`pool::Host`] per remote address
//! - [`forwarding`]: the per-connection pipe and its auto-closer
//! - [`tunnel`]: tunnel lifecycle and connection accounting
//! - [`daemon`]: starts, supervises and drains every tunnel

pub mod config;
pub mod daemon;
pub mod forwarding;
pub mod pool;
pub mod ssh;
pub mod tunnel;

#[cfg(test)]
mod testing;
