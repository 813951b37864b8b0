//! Agent configuration

use crate::reaper::ReapCommand;
use rtunnel_transport::BindAddress;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How accepted remote connections are relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Each relay runs on its own tasks; the accept loop moves on immediately
    #[default]
    Concurrent,

    /// One peer at a time: the relay finishes before the next local dial
    Serial,
}

impl FromStr for RelayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concurrent" => Ok(RelayMode::Concurrent),
            "serial" => Ok(RelayMode::Serial),
            other => Err(format!(
                "Invalid relay mode '{}' (expected 'concurrent' or 'serial')",
                other
            )),
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayMode::Concurrent => write!(f, "concurrent"),
            RelayMode::Serial => write!(f, "serial"),
        }
    }
}

/// Configuration for the agent
///
/// Assembled once at startup and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Local service each accepted connection is relayed to (host:port)
    pub local_endpoint: String,

    /// Address of the listener requested on the relay host
    pub remote_endpoint: BindAddress,

    /// Concurrent (default) or serial relaying
    pub mode: RelayMode,

    /// Command used to clear a stale listener; `None` skips reaping
    pub reap: Option<ReapCommand>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            local_endpoint: "127.0.0.1:22".to_string(),
            remote_endpoint: BindAddress::new("127.0.0.1", 2222),
            mode: RelayMode::Concurrent,
            reap: Some(ReapCommand::default()),
        }
    }
}

impl AgentConfig {
    /// Check that the local endpoint is a dialable `host:port`
    pub fn validate(&self) -> Result<(), String> {
        self.local_endpoint
            .parse::<BindAddress>()
            .map_err(|e| format!("local endpoint: {}", e))?;
        Ok(())
    }
}
