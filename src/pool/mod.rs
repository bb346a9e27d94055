//! Host pool
//!
//! One [`Host`] per remote address for the whole daemon, created on first
//! use and shared by every tunnel that names that address.
//!
//! The registry map is only locked for the lookup-or-insert of a per-address
//! init cell. The initial dial runs inside that cell, so concurrent first
//! uses of one address wait for a single dial while other addresses
//! connect independently.

mod host;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::debug;

pub use host::{Host, HostError};

use crate::config::Address;
use crate::ssh::SessionConnector;

/// Registry of remote address -> [`Host`]
pub struct HostPool {
    connector: Arc<dyn SessionConnector>,
    hosts: DashMap<Address, Arc<OnceCell<Arc<Host>>>>,
}

impl HostPool {
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            connector,
            hosts: DashMap::new(),
        }
    }

    /// Return the host for `remote`, dialing it if this is the first use.
    ///
    /// Every caller for the same address gets the same `Arc<Host>`. If the
    /// initial dial fails the slot stays empty and the error is returned.
    pub async fn get_or_create(&self, remote: &Address) -> Result<Arc<Host>, HostError> {
        let cell = self.hosts.entry(remote.clone()).or_default().clone();
        let host = cell
            .get_or_try_init(|| async {
                debug!("creating host for {}", remote);
                Host::connect(remote.clone(), self.connector.clone())
                    .await
                    .map(Arc::new)
            })
            .await?;
        Ok(host.clone())
    }

    /// Already-connected host for `remote`
    pub fn get(&self, remote: &Address) -> Option<Arc<Host>> {
        self.hosts
            .get(remote)
            .and_then(|cell| cell.get().cloned())
    }

    /// All connected hosts
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect()
    }
}
