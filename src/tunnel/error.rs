use std::io;

use thiserror::Error;

use crate::config::Address;
use crate::pool::HostError;

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel ({name}) failed to open entrance {local}: {source}")]
    Bind {
        name: String,
        local: Address,
        #[source]
        source: io::Error,
    },

    #[error("tunnel ({name}) failed to accept: {source}")]
    Accept {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to dial {destination}: {source}")]
    DirectDial {
        destination: Address,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Host(#[from] HostError),
}

impl TunnelError {
    /// Whether this error must end the whole process.
    ///
    /// Only a host that could not be reached on first use qualifies; bind
    /// failures are fatal or not depending on how the daemon was configured.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TunnelError::Host(HostError::InitialDial { .. }))
    }
}
