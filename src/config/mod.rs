//! Configuration module
//!
//! Turns a YAML file and/or command-line tunnel mappings into validated
//! [`TunnelSpec`]s.
//!
//! # Validation policy
//! - Every tunnel field is checked; problems accumulate instead of stopping
//!   at the first one
//! - Addresses must resolve to IPv4
//! - A tunnel without a local entrance listens on `127.0.0.1:<remote port>`

mod address;
mod file;
mod registry;
mod tunnel;

use std::path::PathBuf;

use thiserror::Error;
use tracing::error;

pub use address::{Address, AddressError};
pub use file::{expand_home, parse_mapping, Config, HostConfig, TunnelConfig};
pub use registry::{HostEntry, HostRegistry};
pub use tunnel::{HostRef, TunnelSpec, ValidationIssue};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid syntax for tunnel '{0}'. Required [<local host>:]<port>:<remote host>:<port>:<forward host>:<port>")]
    InvalidMapping(String),

    #[error("tunnel ({name}) is invalid: {issues:?}")]
    InvalidTunnel {
        name: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("no valid tunnels configured")]
    NoTunnels,
}

/// Result of validating a whole [`Config`]
#[derive(Debug)]
pub struct ValidatedTunnels {
    pub tunnels: Vec<TunnelSpec>,
    pub hosts: HostRegistry,
    /// Number of tunnels dropped as invalid
    pub rejected: usize,
}

impl Config {
    /// Validate every tunnel against the configured hosts.
    ///
    /// With `fail_fast` the first invalid tunnel is an error; otherwise
    /// invalid tunnels are dropped and only an empty result is an error.
    pub fn validate(&mut self) -> Result<ValidatedTunnels, ConfigError> {
        let mut hosts = HostRegistry::from_configs(&self.hosts);
        let mut tunnels = Vec::with_capacity(self.tunnels.len());
        let mut first_failure = None;
        let mut rejected = 0;

        for config in self.tunnels.iter_mut() {
            match config.validate(&mut hosts) {
                Ok(spec) => tunnels.push(spec),
                Err(issues) => {
                    rejected += 1;
                    if first_failure.is_none() {
                        first_failure = Some(ConfigError::InvalidTunnel {
                            name: config.name.clone(),
                            issues,
                        });
                    }
                }
            }
        }

        if self.fail_fast {
            if let Some(err) = first_failure {
                return Err(err);
            }
        }
        if tunnels.is_empty() {
            error!("no valid tunnels configured");
            return Err(first_failure.unwrap_or(ConfigError::NoTunnels));
        }

        Ok(ValidatedTunnels {
            tunnels,
            hosts,
            rejected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
username: deploy
hosts:
  - name: bastion
    address: 10.0.0.5:22
tunnels:
  - name: web
    local: 127.0.0.1:9000
    remote: 127.0.0.1:80
    host: bastion
  - name: broken
    remote: 127.0.0.1:81
    host: nowhere
  - name: direct
    remote: 127.0.0.1:5432
"#;

    #[test]
    fn test_invalid_tunnels_are_skipped() {
        let mut config = Config::from_yaml_str(YAML).unwrap();
        let validated = config.validate().unwrap();
        assert_eq!(validated.tunnels.len(), 2);
        assert_eq!(validated.rejected, 1);
        assert_eq!(validated.hosts.get("bastion").unwrap().references(), 1);
    }

    #[test]
    fn test_fail_fast_rejects_first_invalid_tunnel() {
        let mut config = Config::from_yaml_str(YAML).unwrap();
        config.fail_fast = true;
        match config.validate() {
            Err(ConfigError::InvalidTunnel { name, issues }) => {
                assert_eq!(name, "broken");
                assert_eq!(issues, vec![ValidationIssue::UndefinedHost("nowhere".into())]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_no_tunnels_is_an_error() {
        let mut config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::NoTunnels)));
    }

    #[test]
    fn test_mapping_scenario() {
        let mut config = Config::default();
        config.add_mapping("9000:10.0.0.5:22:127.0.0.1:80").unwrap();
        let validated = config.validate().unwrap();
        let spec = &validated.tunnels[0];
        assert_eq!(spec.local, Address::new("localhost", 9000));
        assert_eq!(spec.remote, Address::new("127.0.0.1", 80));
        assert_eq!(spec.host.as_ref().unwrap().address, Address::new("10.0.0.5", 22));
    }
}
