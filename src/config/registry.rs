//! Named remote hosts known to the configuration

use tracing::{error, info};

use super::{Address, HostConfig};

/// One configured host after its address has been checked
#[derive(Debug, Clone)]
pub struct HostEntry {
    name: String,
    address: Option<Address>,
    references: u32,
}

impl HostEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validated address, `None` when the host is invalid
    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    pub fn valid(&self) -> bool {
        self.address.is_some()
    }

    /// Number of valid tunnels routed through this host
    pub fn references(&self) -> u32 {
        self.references
    }
}

/// Host lookup used while validating tunnels.
///
/// Reference counts are plain fields bumped during validation; tunnels
/// keep the host's address, never a pointer back into the registry.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: Vec<HostEntry>,
}

impl HostRegistry {
    pub fn from_configs(configs: &[HostConfig]) -> Self {
        let mut registry = Self::default();
        for config in configs {
            registry.insert(config);
        }
        registry
    }

    fn insert(&mut self, config: &HostConfig) {
        let name = config.name.trim().to_string();
        if name.is_empty() {
            error!("host ({}) name cannot be blank", config.address);
            return;
        }
        if self.get(&name).is_some() {
            error!("host ({}) defined more than once, keeping the first", name);
            return;
        }

        let address = match config
            .address
            .parse::<Address>()
            .and_then(|addr| addr.validate().map(|_| addr))
        {
            Ok(addr) => Some(addr),
            Err(e) => {
                error!("host ({}) has an invalid address: {}", name, e);
                None
            }
        };

        self.hosts.push(HostEntry {
            name,
            address,
            references: 0,
        });
    }

    /// Look a host up by name
    pub fn get(&self, name: &str) -> Option<&HostEntry> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Record that a valid tunnel routes through `name`
    pub fn mark_referenced(&mut self, name: &str) {
        if let Some(host) = self.hosts.iter_mut().find(|h| h.name == name) {
            host.references += 1;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostEntry> {
        self.hosts.iter()
    }

    /// Log hosts that no tunnel uses
    pub fn report_unreferenced(&self) -> usize {
        let mut count = 0;
        for host in self.hosts.iter().filter(|h| h.references == 0) {
            info!("host ({}) is not referenced by any tunnel", host.name);
            count += 1;
        }
        count
    }
}
