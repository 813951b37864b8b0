//! Transport abstraction layer for reverse tunnels
//!
//! This crate provides transport-agnostic traits that allow the relay core to
//! drive a control session to a relay host without coupling to a specific
//! protocol implementation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    rtunnel-agent                         │
//! │        (reaper, accept loop, connection relay)           │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            rtunnel-transport (this crate)                │
//! │  - ControlSession       - RemoteListener                 │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────────────┬──────────────────────────────┐
//! │ rtunnel-transport-ssh    │ loopback transport (tests)   │
//! └──────────────────────────┴──────────────────────────────┘
//! ```
//!
//! A [`ControlSession`] is one authenticated connection to the relay host. It
//! runs one-off commands and opens [`RemoteListener`]s, which are listening
//! sockets that live on the relay host but are only reachable through the
//! session that created them.

use async_trait::async_trait;
use std::fmt::{self, Debug, Display};
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Authentication as '{user}' on {address} rejected")]
    AuthenticationFailed { address: String, user: String },

    #[error("Host key for {address} rejected: {reason}")]
    HostKeyRejected { address: String, reason: String },

    #[error("Private key error: {0}")]
    KeyError(String),

    #[error("Listen on {address} denied: {reason}")]
    ListenDenied { address: String, reason: String },

    #[error("Remote command '{command}' failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Session closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A `host:port` pair naming a listening endpoint on the relay host.
///
/// The host is kept as text rather than an IP so that names like `localhost`
/// can be passed through to the relay untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindAddress {
    pub host: String,
    pub port: u16,
}

impl BindAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for BindAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| {
            TransportError::ConfigurationError(format!(
                "Invalid address '{}': {} (expected format: host:port)",
                s, why
            ))
        };

        let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            return Err(invalid("host cannot be empty"));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| invalid("port must be a number between 0 and 65535"))?;

        Ok(Self::new(host, port))
    }
}

impl Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Output of a command executed on the relay host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the remote side closed the channel without reporting a status
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// stdout followed by stderr, as a shell would interleave them on a terminal
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !out.is_empty() && !self.stderr.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }
}

/// Where an accepted remote connection came from, as reported by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub originator_address: String,
    pub originator_port: u32,
}

impl Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.originator_address, self.originator_port)
    }
}

/// A listening endpoint on the relay host, multiplexed over a control session
#[async_trait]
pub trait RemoteListener: Send + Sync + Debug {
    /// Byte stream of one accepted remote connection
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next inbound connection.
    ///
    /// Returns [`TransportError::SessionClosed`] once the owning session is gone
    /// and no more connections can arrive.
    async fn accept(&mut self) -> TransportResult<(Self::Stream, PeerInfo)>;

    /// The address this listener is bound to on the relay host
    fn bind_address(&self) -> &BindAddress;

    /// Release the remote socket so the address can be bound again
    async fn close(&mut self);
}

/// One authenticated connection to a relay host
#[async_trait]
pub trait ControlSession: Send + Sync + Debug {
    /// The listener type opened by this session
    type Listener: RemoteListener;

    /// Run a single command on the relay host and collect its output
    async fn run_command(&self, command: &str) -> TransportResult<CommandOutput>;

    /// Ask the relay host to open a listening socket on `addr`
    async fn listen(&self, addr: &BindAddress) -> TransportResult<Self::Listener>;

    /// Close the session, releasing every listener derived from it
    async fn close(&self, reason: &str);

    /// Check if the session is closed
    fn is_closed(&self) -> bool;

    /// The relay host this session is connected to
    fn remote_address(&self) -> &str;
}
