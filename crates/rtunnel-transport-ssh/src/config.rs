//! SSH transport configuration

use russh::keys::ssh_key::{HashAlg, PrivateKey, PublicKey};
use rtunnel_transport::{TransportError, TransportResult};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// How the relay host's identity is checked during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept any host key. The observed fingerprint is still logged on connect.
    #[default]
    AcceptAny,

    /// Require the host key to match an OpenSSH `SHA256:` fingerprint
    Fingerprint(String),
}

impl HostKeyPolicy {
    /// Check a presented host key against this policy.
    ///
    /// Returns the observed fingerprint on success and a rejection reason otherwise.
    pub fn verify(&self, key: &PublicKey) -> Result<String, String> {
        let actual = key.fingerprint(HashAlg::Sha256).to_string();
        self.verify_fingerprint(&actual).map(|_| actual)
    }

    fn verify_fingerprint(&self, actual: &str) -> Result<(), String> {
        match self {
            HostKeyPolicy::AcceptAny => Ok(()),
            HostKeyPolicy::Fingerprint(expected) if expected == actual => Ok(()),
            HostKeyPolicy::Fingerprint(expected) => {
                Err(format!("expected {}, got {}", expected, actual))
            }
        }
    }
}

impl FromStr for HostKeyPolicy {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.strip_prefix("SHA256:") {
            Some(hash) if !hash.is_empty() => Ok(HostKeyPolicy::Fingerprint(s.to_string())),
            _ => Err(TransportError::ConfigurationError(format!(
                "Invalid host key fingerprint '{}' (expected format: SHA256:<base64>)",
                s
            ))),
        }
    }
}

/// SSH-specific configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Host key verification policy
    pub host_key_policy: HostKeyPolicy,

    /// Timeout for TCP connect, key exchange and authentication
    pub connect_timeout: Duration,

    /// Interval between SSH keepalive requests. `None` disables keepalives.
    pub keepalive_interval: Option<Duration>,

    /// Unanswered keepalives tolerated before the session is considered dead
    pub keepalive_max: usize,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host_key_policy: HostKeyPolicy::AcceptAny,
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
        }
    }
}

impl SshConfig {
    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub(crate) fn client_config(&self) -> russh::client::Config {
        russh::client::Config {
            nodelay: true,
            inactivity_timeout: None,
            keepalive_interval: self.keepalive_interval,
            keepalive_max: self.keepalive_max,
            ..Default::default()
        }
    }
}

/// Private key used to authenticate the control session
///
/// Immutable once loaded. The key material is never printed.
#[derive(Clone)]
pub struct TransportCredential {
    key: Arc<PrivateKey>,
    path: PathBuf,
}

impl TransportCredential {
    /// Read and parse an OpenSSH or PEM private key
    pub fn load(path: &Path, passphrase: Option<&str>) -> TransportResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TransportError::KeyError(format!(
                "Cannot read private key file {}: {}",
                path.display(),
                e
            ))
        })?;

        let key = russh::keys::decode_secret_key(&contents, passphrase).map_err(|e| {
            TransportError::KeyError(format!(
                "Cannot parse private key file {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(Self {
            key: Arc::new(key),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn key(&self) -> Arc<PrivateKey> {
        self.key.clone()
    }
}

impl fmt::Debug for TransportCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCredential")
            .field("path", &self.path)
            .field("algorithm", &self.key.algorithm().as_str())
            .finish()
    }
}

/// Expand a leading `~` to the invoking user's home directory
pub fn expand_home(path: &str) -> TransportResult<PathBuf> {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return Ok(PathBuf::from(path)),
    };

    let home = dirs::home_dir().ok_or_else(|| {
        TransportError::ConfigurationError("Cannot determine home directory".to_string())
    })?;

    if rest.is_empty() {
        Ok(home)
    } else {
        Ok(home.join(rest))
    }
}
