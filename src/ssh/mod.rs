//! SSH module - secure sessions to remote hosts
//!
//! This module provides the transport used by hosts, built on russh.
//!
//! # Features
//! - Public key authentication with an injected credential
//! - Host key verification against a known_hosts file
//! - Single-owner session task with a cloneable controller
//! - direct-tcpip channels exposed as plain byte streams

mod client;
mod config;
mod connector;
mod error;
mod handle_owner;
pub mod known_hosts;

pub use client::{ClientHandler, SshClient};
pub use config::{Credentials, SshConfig};
pub use connector::{BoxedStream, ForwardStream, SecureSession, SessionConnector, SshConnector};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
