//! SSH transport implementation using russh
//!
//! Provides the control session to a relay host: public-key authentication,
//! host-key pinning, one-off remote commands over `exec` channels, and remote
//! listeners opened with `tcpip-forward` global requests.
//!
//! # Example
//!
//! ```no_run
//! use rtunnel_transport::{BindAddress, ControlSession, RemoteListener};
//! use rtunnel_transport_ssh::{SshConfig, SshConnector, TransportCredential};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credential = TransportCredential::load(Path::new("/home/packer/.ssh/id_rsa"), None)?;
//! let connector = SshConnector::new(SshConfig::default());
//! let session = connector.connect("dev-server:22", "packer", &credential).await?;
//!
//! let mut listener = session.listen(&"127.0.0.1:2222".parse::<BindAddress>()?).await?;
//! let (_stream, peer) = listener.accept().await?;
//! println!("peer connected from {}", peer);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod listener;

pub use config::{expand_home, HostKeyPolicy, SshConfig, TransportCredential};
pub use connection::{SshConnector, SshSession};
pub use listener::SshListener;
