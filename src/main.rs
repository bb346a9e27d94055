//! auto-ssh - on-demand SSH tunnels
//!
//! Opens local entrances and forwards every accepted connection through a
//! shared, auto-reconnecting SSH session.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use auto_ssh::config::{expand_home, Config, ConfigError};
use auto_ssh::daemon::{Daemon, DaemonError};
use auto_ssh::ssh::{Credentials, KnownHostsStore, SshConfig, SshConnector, SshError};
use auto_ssh::tunnel::TunnelSettings;

/// Automatic tunneling on demand
#[derive(Parser, Debug)]
#[command(name = "auto-ssh")]
#[command(version)]
#[command(long_about = r#"
Opens local tunnel entrances and forwards every connection to a destination
reached through a remote SSH host. Sessions are shared between tunnels that
name the same host and re-established when they drop.

EXAMPLES:
  # Single tunnel
  auto-ssh -u deploy -i ~/.ssh/id_ed25519 \
    -l 127.0.0.1:9000 -r 10.0.0.5:22 -d 127.0.0.1:80

  # Several tunnels, [local host:]port:remote host:port:forward host:port
  auto-ssh -u deploy 9000:10.0.0.5:22:127.0.0.1:80 \
    127.0.0.1:5433:10.0.0.5:22:db.internal:5432

  # Tunnels from a configuration file
  auto-ssh --config tunnels.yaml -v
"#)]
struct Args {
    /// Tunnel mappings ([local host:]port:remote host:port:forward host:port)
    #[arg(value_name = "MAPPING")]
    mappings: Vec<String>,

    /// Remote username
    #[arg(short, long)]
    username: Option<String>,

    /// Private key for authentication
    #[arg(short, long)]
    identity: Option<PathBuf>,

    /// Private key decryption password
    #[arg(short, long, env = "AUTO_SSH_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// known_hosts file used to verify host keys
    #[arg(short = 'k', long)]
    known_hosts: Option<PathBuf>,

    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local tunnel entrance address ("<ip>:<port>")
    #[arg(short, long, requires_all = ["remote", "destination"])]
    local: Option<String>,

    /// Remote tunnel exit address ("<ip>:<port>")
    #[arg(short, long, requires = "destination")]
    remote: Option<String>,

    /// Destination server address ("<ip>:<port>")
    #[arg(short, long, requires = "remote")]
    destination: Option<String>,

    /// More output (-v connection details, -vv per-direction tracing)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    /// Merge the configuration file (if any) with command-line values
    fn into_config(self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(expand_home(path))?,
            None => Config::default(),
        };
        // A bare command line behaves like the single-purpose tool: any bad
        // tunnel ends the process
        config.fail_fast = self.config.is_none();

        if let Some(username) = self.username {
            config.username = username;
        }
        if config.username.is_empty() {
            config.username = std::env::var("USER").unwrap_or_default();
        }
        if self.identity.is_some() {
            config.identity = self.identity;
        }
        if self.passphrase.is_some() {
            config.passphrase = self.passphrase;
        }
        if self.known_hosts.is_some() {
            config.known_hosts = self.known_hosts;
        }

        let mut mappings = self.mappings;
        if let (Some(remote), Some(destination)) = (self.remote, self.destination) {
            let local = match self.local {
                Some(local) => local,
                None => destination
                    .rsplit_once(':')
                    .map(|(_, port)| port.to_string())
                    .unwrap_or_default(),
            };
            mappings.push(format!("{local}:{remote}:{destination}"));
        }
        for mapping in &mappings {
            config.add_mapping(mapping)?;
        }
        Ok(config)
    }
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().with_target(verbosity > 1))
        .init();
}

fn default_identity() -> Option<PathBuf> {
    let ssh_dir = dirs::home_dir()?.join(".ssh");
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.exists())
}

fn ssh_config(config: &Config) -> Result<SshConfig, DaemonError> {
    let identity = config
        .identity
        .as_deref()
        .map(expand_home)
        .or_else(default_identity)
        .ok_or_else(|| {
            DaemonError::Ssh(SshError::KeyError(
                "no identity file given and none found in ~/.ssh".to_string(),
            ))
        })?;
    let credentials =
        Credentials::load(config.username.clone(), &identity, config.passphrase.as_deref())?;

    let mut ssh = SshConfig::new(credentials);
    ssh.timeout = Duration::from_secs(config.connect_timeout_secs);
    ssh.keepalive = (config.keepalive_secs > 0).then(|| Duration::from_secs(config.keepalive_secs));
    ssh.strict_host_key_checking = config.strict_host_key_checking;
    ssh.known_hosts = match &config.known_hosts {
        Some(path) => Some(Arc::new(KnownHostsStore::load(expand_home(path))?)),
        None => {
            warn!("no known_hosts file configured, accepting any host key");
            None
        }
    };
    Ok(ssh)
}

async fn run(args: Args) -> Result<(), DaemonError> {
    let mut config = args.into_config()?;
    let validated = config.validate()?;
    validated.hosts.report_unreferenced();
    if validated.rejected > 0 {
        warn!("{} invalid tunnel(s) skipped", validated.rejected);
    }

    let ssh = ssh_config(&config)?;
    let settings = TunnelSettings {
        auto_close: config.auto_close(),
        idle_timeout: config.idle_timeout(),
    };
    let connector = Arc::new(SshConnector::new(ssh));
    let daemon = Daemon::new(connector, validated.tunnels, settings).fail_fast(config.fail_fast);

    info!("auto-ssh {} starting", env!("CARGO_PKG_VERSION"));
    daemon.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mappings_become_fail_fast_tunnels() {
        let args = Args::parse_from([
            "auto-ssh",
            "-u",
            "deploy",
            "9000:10.0.0.5:22:127.0.0.1:80",
            "127.0.0.1:9001:10.0.0.5:22:127.0.0.1:81",
        ]);
        let config = args.into_config().unwrap();
        assert!(config.fail_fast);
        assert_eq!(config.username, "deploy");
        assert_eq!(config.tunnels.len(), 2);
        // Same remote, one host
        assert_eq!(config.hosts.len(), 1);
        assert_eq!(config.tunnels[0].local.as_deref(), Some("localhost:9000"));
    }

    #[test]
    fn test_single_tunnel_shortcut() {
        let args = Args::parse_from([
            "auto-ssh",
            "-l",
            "127.0.0.1:9000",
            "-r",
            "10.0.0.5:22",
            "-d",
            "127.0.0.1:80",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.tunnels.len(), 1);
        assert_eq!(config.tunnels[0].remote.as_deref(), Some("127.0.0.1:80"));
        assert_eq!(config.tunnels[0].host.as_deref(), Some("10.0.0.5:22"));
    }

    #[test]
    fn test_command_line_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnels.yaml");
        std::fs::write(
            &path,
            "username: from-file\ntunnels:\n  - name: db\n    remote: 127.0.0.1:5432\n",
        )
        .unwrap();

        let args = Args::parse_from([
            "auto-ssh",
            "-c",
            path.to_str().unwrap(),
            "-u",
            "from-cli",
        ]);
        let config = args.into_config().unwrap();
        assert!(!config.fail_fast);
        assert_eq!(config.username, "from-cli");
        assert_eq!(config.tunnels.len(), 1);
    }

    #[test]
    fn test_bad_mapping_is_rejected() {
        let args = Args::parse_from(["auto-ssh", "9000:10.0.0.5"]);
        assert!(matches!(args.into_config(), Err(ConfigError::InvalidMapping(_))));
    }
}
