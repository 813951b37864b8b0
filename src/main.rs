//! rtunnel - SSH reverse tunnel
//!
//! Publishes a local TCP service on a listening port of a relay host, reached
//! over an authenticated SSH control session.

use anyhow::{Context, Result};
use clap::Parser;
use rtunnel_agent::{Agent, AgentConfig, ReapCommand, RelayMode};
use rtunnel_transport::BindAddress;
use rtunnel_transport_ssh::{expand_home, HostKeyPolicy, SshConfig, SshConnector, TransportCredential};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_REMOTE_SERVER: &str = "dev-server:22";
const DEFAULT_REMOTE_SERVER_USER: &str = "packer";
const DEFAULT_REMOTE_SERVER_KEY: &str = "~/.ssh/id_rsa";
const DEFAULT_LOCAL_ENDPOINT: &str = "127.0.0.1:22";
const DEFAULT_REMOTE_ENDPOINT: &str = "127.0.0.1:2222";

/// rtunnel - expose a local service on a port of a remote SSH server
#[derive(Parser, Debug)]
#[command(name = "rtunnel")]
#[command(about = "Expose a local service on a port of a remote SSH server")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
rtunnel logs into a relay host over SSH, asks it to listen on the remote
endpoint, and relays every connection accepted there to the local endpoint.
Any stale process still holding the remote port is killed first.

EXAMPLES:
  # Publish the local SSH daemon on port 2222 of dev-server
  rtunnel --remote-server dev-server:22 --remote-server-user packer

  # Publish a web app, pinning the relay's host key
  rtunnel --local-endpoint 127.0.0.1:8080 \
    --remote-endpoint 0.0.0.0:8080 \
    --remote-host-key SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8

  # Use a config file and one relay at a time
  rtunnel --config tunnel.yaml --mode serial

ENVIRONMENT VARIABLES:
  REMOTE_SERVER                 SSH server address (host:port)
  REMOTE_SERVER_USER            SSH user
  REMOTE_SERVER_KEY             Private key file
  REMOTE_SERVER_KEY_PASSPHRASE  Passphrase of an encrypted private key
  REMOTE_HOST_KEY               Expected host key fingerprint (SHA256:...)
  LOCAL_ENDPOINT                Local service to expose (host:port)
  REMOTE_ENDPOINT               Listening address on the SSH server (host:port)
  TUNNEL_MODE                   concurrent or serial
  REAP_COMMAND                  Stale-listener kill command with {port}
  TUNNEL_NO_REAP                Skip killing stale listeners
"#)]
struct Args {
    /// SSH server address (e.g., dev-server:22)
    #[arg(long, env = "REMOTE_SERVER")]
    remote_server: Option<String>,

    /// SSH user on the remote server
    #[arg(long, env = "REMOTE_SERVER_USER")]
    remote_server_user: Option<String>,

    /// Private key used to authenticate (a leading ~ is expanded)
    #[arg(long, env = "REMOTE_SERVER_KEY")]
    remote_server_key: Option<String>,

    /// Passphrase for an encrypted private key
    #[arg(long, env = "REMOTE_SERVER_KEY_PASSPHRASE", hide_env_values = true)]
    remote_server_key_passphrase: Option<String>,

    /// Expected SHA256 fingerprint of the server's host key
    #[arg(long, env = "REMOTE_HOST_KEY")]
    remote_host_key: Option<String>,

    /// Local service each remote connection is relayed to (host:port)
    #[arg(long, env = "LOCAL_ENDPOINT")]
    local_endpoint: Option<String>,

    /// Address the remote server listens on (host:port)
    #[arg(long, env = "REMOTE_ENDPOINT")]
    remote_endpoint: Option<String>,

    /// Relay connections concurrently or one at a time
    #[arg(long, env = "TUNNEL_MODE")]
    mode: Option<RelayMode>,

    /// Remote command that kills the owner of {port} before listening
    #[arg(long, env = "REAP_COMMAND")]
    reap_command: Option<String>,

    /// Do not kill stale listeners on the remote port
    #[arg(long, env = "TUNNEL_NO_REAP")]
    no_reap: bool,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    /// SSH server the tunnel is opened on
    #[serde(default)]
    relay: RelayFileConfig,

    /// Endpoints and relaying behaviour
    #[serde(default)]
    tunnel: TunnelFileConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RelayFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    key_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    host_key_fingerprint: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TunnelFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    local_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    remote_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<RelayMode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    reap_command: Option<String>,

    /// Set to false to skip reaping
    #[serde(skip_serializing_if = "Option::is_none")]
    reap: Option<bool>,
}

/// Fully resolved settings
#[derive(Debug)]
struct Settings {
    remote_server: String,
    user: String,
    key_path: PathBuf,
    key_passphrase: Option<String>,
    host_key_policy: HostKeyPolicy,
    agent: AgentConfig,
}

impl Settings {
    /// Log every setting except the passphrase
    fn log(&self) {
        info!("Remote server: {}", self.remote_server);
        info!("Remote server user: {}", self.user);
        info!("Remote server key: {}", self.key_path.display());
        match &self.host_key_policy {
            HostKeyPolicy::Fingerprint(fingerprint) => info!("Remote host key: {}", fingerprint),
            HostKeyPolicy::AcceptAny => info!("Remote host key: not pinned"),
        }
        info!("Local endpoint: {}", self.agent.local_endpoint);
        info!("Remote endpoint: {}", self.agent.remote_endpoint);
        info!("Relay mode: {}", self.agent.mode);
        match &self.agent.reap {
            Some(command) => info!("Reap command: {}", command.template()),
            None => info!("Reap command: disabled"),
        }
    }
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with the config file and defaults, giving precedence to CLI args
fn resolve_settings(args: Args) -> Result<Settings> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let remote_server = args
        .remote_server
        .or(file.relay.address)
        .unwrap_or_else(|| DEFAULT_REMOTE_SERVER.to_string());
    let user = args
        .remote_server_user
        .or(file.relay.user)
        .unwrap_or_else(|| DEFAULT_REMOTE_SERVER_USER.to_string());
    let key_path = args
        .remote_server_key
        .or(file.relay.key_path)
        .unwrap_or_else(|| DEFAULT_REMOTE_SERVER_KEY.to_string());
    let host_key = args.remote_host_key.or(file.relay.host_key_fingerprint);
    let local_endpoint = args
        .local_endpoint
        .or(file.tunnel.local_endpoint)
        .unwrap_or_else(|| DEFAULT_LOCAL_ENDPOINT.to_string());
    let remote_endpoint = args
        .remote_endpoint
        .or(file.tunnel.remote_endpoint)
        .unwrap_or_else(|| DEFAULT_REMOTE_ENDPOINT.to_string());
    let mode = args.mode.or(file.tunnel.mode).unwrap_or_default();

    if user.is_empty() {
        anyhow::bail!("Remote server user is required (use --remote-server-user or config file)");
    }

    validate_address(&remote_server, "remote server")?;
    validate_address(&local_endpoint, "local endpoint")?;
    let remote_endpoint = validate_address(&remote_endpoint, "remote endpoint")?;

    let host_key_policy = match host_key.filter(|fp| !fp.trim().is_empty()) {
        Some(fingerprint) => fingerprint
            .parse::<HostKeyPolicy>()
            .context("Invalid remote host key")?,
        None => HostKeyPolicy::AcceptAny,
    };

    let reap_enabled = !args.no_reap && file.tunnel.reap.unwrap_or(true);
    let reap = if reap_enabled {
        let command = match args.reap_command.or(file.tunnel.reap_command) {
            Some(template) => ReapCommand::new(template).map_err(anyhow::Error::msg)?,
            None => ReapCommand::default(),
        };
        Some(command)
    } else {
        None
    };

    let key_path = expand_home(&key_path).context("Invalid remote server key path")?;

    Ok(Settings {
        remote_server,
        user,
        key_path,
        key_passphrase: args.remote_server_key_passphrase,
        host_key_policy,
        agent: AgentConfig {
            local_endpoint,
            remote_endpoint,
            mode,
            reap,
        },
    })
}

/// Validate address format (should be host:port)
fn validate_address(addr: &str, addr_type: &str) -> Result<BindAddress> {
    addr.parse::<BindAddress>()
        .with_context(|| format!("Invalid {} address: '{}'", addr_type, addr))
}

/// Connect to the remote server and run the tunnel until a fatal error
async fn run(settings: Settings) -> Result<()> {
    let credential = TransportCredential::load(
        &settings.key_path,
        settings.key_passphrase.as_deref(),
    )
    .context("Failed to load private key")?;

    let connector = SshConnector::new(
        SshConfig::default().with_host_key_policy(settings.host_key_policy.clone()),
    );
    let session = connector
        .connect(&settings.remote_server, &settings.user, &credential)
        .await
        .with_context(|| format!("Failed to connect to {}", settings.remote_server))?;

    let agent = Agent::new(settings.agent, Arc::new(session)).context("Failed to create agent")?;
    agent.run().await?;

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("rtunnel {} ({}) starting...", env!("GIT_TAG"), env!("GIT_HASH"));

    let settings = resolve_settings(args).context("Failed to build tunnel configuration")?;
    settings.log();

    tokio::select! {
        result = run(settings) => {
            if let Err(e) = &result {
                error!("Tunnel failed: {:#}", e);
            }
            result
        }
        signal = shutdown_signal() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Interrupt received, stopping...");
            Ok(())
        }
    }
}
