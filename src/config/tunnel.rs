//! Tunnel validation

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{Address, AddressError, HostRegistry, TunnelConfig};

/// A single problem found while validating a tunnel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    #[error("tunnel name cannot be blank")]
    BlankName,

    #[error("requires a forward address")]
    MissingRemote,

    #[error("invalid forward address: {0}")]
    InvalidRemote(AddressError),

    #[error("missing a local address that cannot be derived")]
    MissingLocal,

    #[error("invalid local address: {0}")]
    InvalidLocal(AddressError),

    #[error("remote host ({0}) undefined")]
    UndefinedHost(String),

    #[error("remote host ({0}) is invalid")]
    InvalidHost(String),
}

/// The host a tunnel hops through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRef {
    pub name: String,
    pub address: Address,
}

/// A validated tunnel, ready to become a running entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub id: String,
    pub name: String,
    /// Local entrance
    pub local: Address,
    /// Address the entrance forwards toward
    pub remote: Address,
    /// Host whose session reaches `remote`; `None` dials it directly
    pub host: Option<HostRef>,
}

impl TunnelSpec {
    pub fn new(name: impl Into<String>, local: Address, remote: Address) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            local,
            remote,
            host: None,
        }
    }

    pub fn via(mut self, name: impl Into<String>, address: Address) -> Self {
        self.host = Some(HostRef {
            name: name.into(),
            address,
        });
        self
    }
}

fn parse_and_validate(raw: &str) -> Result<Address, AddressError> {
    let addr: Address = raw.parse()?;
    addr.validate()?;
    Ok(addr)
}

impl TunnelConfig {
    /// Check every field, logging each problem, and build a [`TunnelSpec`].
    ///
    /// All fields are checked even after the first failure so a single run
    /// reports every problem. The referenced host is only marked when the
    /// tunnel is otherwise valid.
    pub fn validate(&mut self, hosts: &mut HostRegistry) -> Result<TunnelSpec, Vec<ValidationIssue>> {
        let mut issues = Vec::new();

        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            error!("tunnel name cannot be blank");
            issues.push(ValidationIssue::BlankName);
        }
        let name = self.name.clone();

        let remote = match self.remote.as_deref().map(str::trim) {
            None | Some("") => {
                error!("tunnel ({}) requires a forward address", name);
                issues.push(ValidationIssue::MissingRemote);
                None
            }
            Some(raw) => match parse_and_validate(raw) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    error!("tunnel ({}) forward address: {}", name, e);
                    issues.push(ValidationIssue::InvalidRemote(e));
                    None
                }
            },
        };

        let local_blank = matches!(self.local.as_deref().map(str::trim), None | Some(""));
        if local_blank {
            if let Some(remote) = &remote {
                let default = Address::loopback(remote.port());
                warn!(
                    "tunnel ({}) local entrance undefined. Defaulting to {}",
                    name, default
                );
                self.local = Some(default.to_string());
            }
        }

        let local = match self.local.as_deref().map(str::trim) {
            None | Some("") => {
                error!("tunnel ({}) missing a local address that cannot be derived", name);
                issues.push(ValidationIssue::MissingLocal);
                None
            }
            Some(raw) => match parse_and_validate(raw) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    error!("tunnel ({}) local address: {}", name, e);
                    issues.push(ValidationIssue::InvalidLocal(e));
                    None
                }
            },
        };

        let mut host = None;
        match self.host.as_deref().map(str::trim) {
            None | Some("") => {
                self.host = None;
                info!("tunnel ({}) exits on the local host", name);
            }
            Some(host_name) => match hosts.get(host_name) {
                None => {
                    error!("tunnel ({}) remote host ({}) undefined", name, host_name);
                    issues.push(ValidationIssue::UndefinedHost(host_name.to_string()));
                }
                Some(entry) => match entry.address() {
                    None => {
                        error!("tunnel ({}) remote host ({}) is invalid", name, host_name);
                        issues.push(ValidationIssue::InvalidHost(host_name.to_string()));
                    }
                    Some(address) => {
                        host = Some(HostRef {
                            name: host_name.to_string(),
                            address: address.clone(),
                        });
                    }
                },
            },
        }

        match (issues.is_empty(), local, remote) {
            (true, Some(local), Some(remote)) => {
                if let Some(host) = &host {
                    hosts.mark_referenced(&host.name);
                }
                debug!("tunnel ({}) validated", name);
                Ok(TunnelSpec {
                    id: uuid::Uuid::new_v4().to_string(),
                    name,
                    local,
                    remote,
                    host,
                })
            }
            _ => Err(issues),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;

    fn registry() -> HostRegistry {
        HostRegistry::from_configs(&[
            HostConfig {
                name: "bastion".into(),
                address: "10.0.0.5:22".into(),
            },
            HostConfig {
                name: "broken".into(),
                address: "nowhere".into(),
            },
        ])
    }

    fn tunnel(name: &str, local: Option<&str>, remote: Option<&str>, host: Option<&str>) -> TunnelConfig {
        TunnelConfig {
            name: name.into(),
            local: local.map(Into::into),
            remote: remote.map(Into::into),
            host: host.map(Into::into),
        }
    }

    #[test]
    fn test_valid_tunnel_via_host() {
        let mut hosts = registry();
        let mut config = tunnel(" web ", Some("127.0.0.1:9000"), Some("127.0.0.1:80"), Some("bastion"));
        let spec = config.validate(&mut hosts).unwrap();
        assert_eq!(spec.name, "web");
        assert_eq!(spec.local, Address::new("127.0.0.1", 9000));
        assert_eq!(spec.remote, Address::new("127.0.0.1", 80));
        assert_eq!(spec.host.unwrap().address, Address::new("10.0.0.5", 22));
        assert_eq!(hosts.get("bastion").unwrap().references(), 1);
    }

    #[test]
    fn test_local_defaults_to_loopback_remote_port() {
        let mut hosts = registry();
        let mut config = tunnel("db", None, Some("127.0.0.1:5432"), None);
        let spec = config.validate(&mut hosts).unwrap();
        assert_eq!(spec.local, Address::loopback(5432));
        assert_eq!(config.local.as_deref(), Some("127.0.0.1:5432"));
        assert!(spec.host.is_none());
    }

    #[test]
    fn test_all_problems_are_reported() {
        let mut hosts = registry();
        let mut config = tunnel("   ", None, None, Some("missing"));
        let issues = config.validate(&mut hosts).unwrap_err();
        assert_eq!(
            issues,
            vec![
                ValidationIssue::BlankName,
                ValidationIssue::MissingRemote,
                ValidationIssue::MissingLocal,
                ValidationIssue::UndefinedHost("missing".into()),
            ]
        );
    }

    #[test]
    fn test_invalid_host_is_not_referenced() {
        let mut hosts = registry();
        let mut config = tunnel("web", Some("127.0.0.1:9000"), Some("127.0.0.1:80"), Some("broken"));
        let issues = config.validate(&mut hosts).unwrap_err();
        assert_eq!(issues, vec![ValidationIssue::InvalidHost("broken".into())]);
        assert_eq!(hosts.get("broken").unwrap().references(), 0);
    }

    #[test]
    fn test_otherwise_invalid_tunnel_does_not_reference_host() {
        let mut hosts = registry();
        let mut config = tunnel("web", Some("127.0.0.1:0"), Some("127.0.0.1:80"), Some("bastion"));
        let issues = config.validate(&mut hosts).unwrap_err();
        assert!(matches!(issues[0], ValidationIssue::InvalidLocal(_)));
        assert_eq!(hosts.get("bastion").unwrap().references(), 0);
    }
}
