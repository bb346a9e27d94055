//! Daemon configuration: YAML file and command-line tunnel mappings

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Address, ConfigError};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote username used for every host
    #[serde(default)]
    pub username: String,

    /// Private key used to authenticate against every host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<PathBuf>,

    /// Optional passphrase for an encrypted identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,

    /// known_hosts file used to verify host keys (absent = accept any key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts: Option<PathBuf>,

    /// Reject hosts that are missing from known_hosts
    #[serde(default = "default_true")]
    pub strict_host_key_checking: bool,

    /// SSH connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// SSH keepalive interval in seconds (0 = disabled)
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// How long a half-closed connection may linger before it is force-closed
    /// (0 = default)
    #[serde(default = "default_auto_close")]
    pub auto_close_secs: u64,

    /// Close a connection after this many idle seconds (0 = never)
    #[serde(default)]
    pub idle_timeout_secs: u64,

    /// Remote hosts tunnels may hop through
    #[serde(default)]
    pub hosts: Vec<HostConfig>,

    /// Tunnels to open
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,

    /// Fail the whole daemon on the first invalid tunnel or bind failure
    #[serde(skip)]
    pub fail_fast: bool,
}

/// A named remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub address: String,
}

/// Raw tunnel definition, checked by [`TunnelConfig::validate`](super::TunnelConfig::validate)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub name: String,

    /// Local entrance (defaults to `127.0.0.1:<remote port>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,

    /// Address the entrance forwards toward
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,

    /// Name of the host to hop through (absent = dial directly)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    30
}

fn default_auto_close() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: String::new(),
            identity: None,
            passphrase: None,
            known_hosts: None,
            strict_host_key_checking: true,
            connect_timeout_secs: default_connect_timeout(),
            keepalive_secs: default_keepalive(),
            auto_close_secs: default_auto_close(),
            idle_timeout_secs: 0,
            hosts: Vec::new(),
            tunnels: Vec::new(),
            fail_fast: false,
        }
    }
}

impl Config {
    /// Load a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded configuration from {}", path.display());
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Add a command-line tunnel mapping.
    ///
    /// The hop host is registered under its address so that every mapping
    /// naming the same remote shares one host entry.
    pub fn add_mapping(&mut self, mapping: &str) -> Result<(), ConfigError> {
        let (tunnel, host) = parse_mapping(mapping)?;
        if !self.hosts.iter().any(|h| h.name == host.name) {
            self.hosts.push(host);
        }
        self.tunnels.push(tunnel);
        Ok(())
    }

    /// Auto-close window, zero falls back to the default
    pub fn auto_close(&self) -> Duration {
        if self.auto_close_secs == 0 {
            warn!("auto_close_secs is 0, using {}s", default_auto_close());
            return Duration::from_secs(default_auto_close());
        }
        Duration::from_secs(self.auto_close_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Parse `local:port:remote:port:forward:port` or `port:remote:port:forward:port`.
///
/// `remote` is the SSH host the tunnel hops through and `forward` is the
/// destination reached from it. The 5-field form listens on `localhost`.
pub fn parse_mapping(mapping: &str) -> Result<(TunnelConfig, HostConfig), ConfigError> {
    let mapping = mapping.trim();
    let parts: Vec<&str> = mapping.split(':').collect();

    let (local, remote, forward) = match parts.as_slice() {
        [lh, lp, rh, rp, fh, fp] => (
            format!("{lh}:{lp}"),
            format!("{rh}:{rp}"),
            format!("{fh}:{fp}"),
        ),
        [lp, rh, rp, fh, fp] => (
            format!("localhost:{lp}"),
            format!("{rh}:{rp}"),
            format!("{fh}:{fp}"),
        ),
        _ => return Err(ConfigError::InvalidMapping(mapping.to_string())),
    };

    // Reject malformed pieces here so the operator sees the mapping, not a field name
    for piece in [&local, &remote, &forward] {
        piece
            .parse::<Address>()
            .map_err(|_| ConfigError::InvalidMapping(mapping.to_string()))?;
    }

    let host = HostConfig {
        name: remote.clone(),
        address: remote.clone(),
    };
    let tunnel = TunnelConfig {
        name: mapping.to_string(),
        local: Some(local),
        remote: Some(forward),
        host: Some(remote),
    };
    Ok((tunnel, host))
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
