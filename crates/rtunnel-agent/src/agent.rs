use crate::config::{AgentConfig, RelayMode};
use crate::connection::{ActiveRelays, RelayInfo};
use crate::reaper::{self, ReapError};
use crate::relay::relay;
use rtunnel_transport::{BindAddress, ControlSession, PeerInfo, RemoteListener, TransportError};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Errors that end the agent
///
/// Every variant is fatal: the process is expected to exit and let its
/// supervisor restart it.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Listen on remote endpoint {address} failed: {source}")]
    Listen {
        address: String,
        #[source]
        source: TransportError,
    },

    #[error("Dial into local service {address} failed: {source}")]
    LocalDial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Accept on remote endpoint {address} failed: {source}")]
    Accept {
        address: String,
        #[source]
        source: TransportError,
    },
}

/// Lifecycle of the accept loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    /// Listener bound on the relay at the given address
    Listening(BindAddress),
    /// Local connection dialed, waiting for a remote peer
    Accepting,
    /// Remote peer handed to a relay pair
    Relaying(u64),
    Closed,
}

/// The tunnel agent - exposes a local service through a listener on the relay host
pub struct Agent<S: ControlSession> {
    config: AgentConfig,

    /// Shared read-only by the reaper and the listener
    session: Arc<S>,

    relays: ActiveRelays,

    state: watch::Sender<AgentState>,
}

impl<S> Agent<S>
where
    S: ControlSession + 'static,
{
    /// Create a new agent on top of an established control session
    pub fn new(config: AgentConfig, session: Arc<S>) -> Result<Self, AgentError> {
        config.validate().map_err(AgentError::InvalidConfig)?;
        let (state, _) = watch::channel(AgentState::Idle);

        Ok(Self {
            config,
            session,
            relays: ActiveRelays::new(),
            state,
        })
    }

    /// Subscribe to lifecycle transitions
    pub fn state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Handle on the live relay pairs
    pub fn active_relays(&self) -> ActiveRelays {
        self.relays.clone()
    }

    /// Reap, listen, then accept and relay connections until a fatal error.
    ///
    /// This only returns with an error; stopping on a signal is the caller's job.
    pub async fn run(&self) -> Result<(), AgentError> {
        tracing::info!(
            relay = %self.session.remote_address(),
            remote_endpoint = %self.config.remote_endpoint,
            local_endpoint = %self.config.local_endpoint,
            mode = %self.config.mode,
            "Starting agent"
        );

        self.reap().await;

        let mut listener = match self.open_listener().await {
            Ok(listener) => listener,
            Err(e) => {
                self.shutdown(None).await;
                return Err(e);
            }
        };

        let result = self.accept_loop(&mut listener).await;
        self.shutdown(Some(&mut listener)).await;
        result
    }

    /// Clear the remote port. Failures are logged and never stop the agent.
    ///
    /// Returns the killed PID if a stale process was found.
    pub async fn reap(&self) -> Option<u32> {
        let command = self.config.reap.as_ref()?;
        let port = self.config.remote_endpoint.port;
        if port == 0 {
            tracing::debug!("Remote port assigned by relay, nothing to reap");
            return None;
        }

        match reaper::clear_port(self.session.as_ref(), command, port).await {
            Ok(killed) => killed,
            Err(ReapError::Transport(e)) => {
                tracing::warn!(port = port, error = %e, "Could not run reap command, continuing");
                None
            }
            Err(e) => {
                tracing::warn!(port = port, error = %e, "Reap failed, continuing");
                None
            }
        }
    }

    async fn open_listener(&self) -> Result<S::Listener, AgentError> {
        tracing::info!(remote_endpoint = %self.config.remote_endpoint, "Opening remote endpoint");

        let listener = self
            .session
            .listen(&self.config.remote_endpoint)
            .await
            .map_err(|source| AgentError::Listen {
                address: self.config.remote_endpoint.to_string(),
                source,
            })?;

        self.state
            .send_replace(AgentState::Listening(listener.bind_address().clone()));
        Ok(listener)
    }

    async fn accept_loop(&self, listener: &mut S::Listener) -> Result<(), AgentError> {
        let local_endpoint = self.config.local_endpoint.as_str();

        loop {
            // The local dial happens before we know a peer will arrive
            tracing::info!(local_endpoint = %local_endpoint, "Opening local endpoint");
            let local = TcpStream::connect(local_endpoint).await.map_err(|source| {
                AgentError::LocalDial {
                    address: local_endpoint.to_string(),
                    source,
                }
            })?;

            self.state.send_replace(AgentState::Accepting);
            tracing::info!(
                remote_endpoint = %listener.bind_address(),
                "Waiting for new connection from remote endpoint"
            );
            let (remote, peer) = listener.accept().await.map_err(|source| AgentError::Accept {
                address: listener.bind_address().to_string(),
                source,
            })?;

            let relay_id = self.relays.next_id();
            self.state.send_replace(AgentState::Relaying(relay_id));
            tracing::info!(relay_id = relay_id, peer = %peer, "Transferring data");

            let relays = self.relays.clone();
            let pair = run_pair(relays, relay_id, peer, local_endpoint.to_string(), remote, local);
            match self.config.mode {
                RelayMode::Serial => pair.await,
                RelayMode::Concurrent => {
                    tokio::spawn(pair);
                }
            }
        }
    }

    async fn shutdown(&self, listener: Option<&mut S::Listener>) {
        if let Some(listener) = listener {
            listener.close().await;
        }
        self.session.close("agent stopped").await;
        self.state.send_replace(AgentState::Closed);
        tracing::info!("Agent stopped");
    }
}

async fn run_pair<R>(
    relays: ActiveRelays,
    relay_id: u64,
    peer: PeerInfo,
    local_endpoint: String,
    remote: R,
    local: TcpStream,
) where
    R: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    relays
        .register(RelayInfo {
            relay_id,
            peer: peer.to_string(),
            local_endpoint,
            established_at: Instant::now(),
        })
        .await;

    relay(relay_id, remote, local).await;

    relays.unregister(relay_id).await;
}
