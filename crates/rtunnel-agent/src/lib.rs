//! Reverse tunnel agent - exposes a local service through a relay host
//!
//! The agent drives an already-authenticated control session to a relay host.
//! It asks the relay to open a listening socket, and shuttles bytes between
//! every connection accepted there and a fresh connection to the local service.
//!
//! # Example Usage
//!
//! ```ignore
//! use rtunnel_agent::{Agent, AgentConfig};
//! use std::sync::Arc;
//!
//! let session = Arc::new(connector.connect("dev-server:22", "packer", &credential).await?);
//! let agent = Agent::new(AgentConfig::default(), session)?;
//! agent.run().await?;
//! ```
//!
//! # Architecture
//!
//! 1. **Reap**: Kill any stale process still holding the remote port
//! 2. **Listen**: Open the remote listener through the control session
//! 3. **Dial**: Connect to the local service ahead of the next peer
//! 4. **Accept**: Wait for a remote peer on the listener
//! 5. **Relay**: Copy bytes both ways until either side finishes
//!
//! Relays run concurrently by default; [`RelayMode::Serial`] serves one peer at
//! a time. Failing to listen, dial the local service, or accept is fatal.

mod agent;
mod config;
mod connection;
pub mod reaper;
pub mod relay;

// Re-export public API
pub use agent::{Agent, AgentError, AgentState};
pub use config::{AgentConfig, RelayMode};
pub use connection::{ActiveRelays, RelayInfo};
pub use reaper::{clear_port, ReapCommand, ReapError};
pub use relay::{relay, RelayDirection, RelayStats, COPY_BUFFER_SIZE};
