//! SSH control session implementation

use crate::config::{HostKeyPolicy, SshConfig, TransportCredential};
use crate::listener::{ForwardRoutes, ForwardedChannel, SshListener};
use async_trait::async_trait;
use russh::client::{self, Handle, Msg, Session};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect};
use rtunnel_transport::{
    BindAddress, CommandOutput, ControlSession, TransportError, TransportResult,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Establishes outbound control sessions to a relay host
#[derive(Debug, Clone)]
pub struct SshConnector {
    config: Arc<SshConfig>,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Connect to `address` and authenticate as `username` with `credential`
    pub async fn connect(
        &self,
        address: &str,
        username: &str,
        credential: &TransportCredential,
    ) -> TransportResult<SshSession> {
        info!(
            relay = %address,
            user = %username,
            key = %credential.path().display(),
            "Connecting to relay host"
        );

        let result = self.establish(address, username, credential).await;
        match &result {
            Ok(_) => info!(relay = %address, user = %username, "Control session established"),
            Err(e) => warn!(relay = %address, user = %username, error = %e, "Control session failed"),
        }
        result
    }

    async fn establish(
        &self,
        address: &str,
        username: &str,
        credential: &TransportCredential,
    ) -> TransportResult<SshSession> {
        let routes = ForwardRoutes::default();
        let rejection = Arc::new(Mutex::new(None));
        let handler = TunnelHandler {
            address: address.to_string(),
            host_key_policy: self.config.host_key_policy.clone(),
            rejection: rejection.clone(),
            routes: routes.clone(),
        };

        let client_config = Arc::new(self.config.client_config());
        let timeout = self.config.connect_timeout;

        let connect_failed = |reason: String| TransportError::ConnectionFailed {
            address: address.to_string(),
            reason,
        };

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(client_config, address, handler),
        )
        .await
        .map_err(|_| connect_failed(format!("timed out after {:?}", timeout)))?
        .map_err(|e| {
            // A rejected host key surfaces as a generic handshake error
            let rejected = rejection.lock().ok().and_then(|mut r| r.take());
            match rejected {
                Some(reason) => TransportError::HostKeyRejected {
                    address: address.to_string(),
                    reason,
                },
                None => connect_failed(e.to_string()),
            }
        })?;

        let rsa_hash = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| connect_failed(e.to_string()))?
            .flatten();

        let auth = tokio::time::timeout(
            timeout,
            handle.authenticate_publickey(
                username,
                PrivateKeyWithHashAlg::new(credential.key(), rsa_hash),
            ),
        )
        .await
        .map_err(|_| connect_failed("authentication timed out".to_string()))?
        .map_err(|e| connect_failed(e.to_string()))?;

        if !auth.success() {
            return Err(TransportError::AuthenticationFailed {
                address: address.to_string(),
                user: username.to_string(),
            });
        }

        Ok(SshSession {
            address: address.to_string(),
            handle: Arc::new(AsyncMutex::new(handle)),
            routes,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// An authenticated SSH connection to the relay host
#[derive(Clone)]
pub struct SshSession {
    address: String,
    handle: Arc<AsyncMutex<Handle<TunnelHandler>>>,
    routes: ForwardRoutes,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for SshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSession")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl ControlSession for SshSession {
    type Listener = SshListener;

    async fn run_command(&self, command: &str) -> TransportResult<CommandOutput> {
        let command_failed = |reason: String| TransportError::CommandFailed {
            command: command.to_string(),
            reason,
        };

        let mut channel = {
            let handle = self.handle.lock().await;
            if handle.is_closed() {
                return Err(TransportError::SessionClosed);
            }
            handle
                .channel_open_session()
                .await
                .map_err(|e| command_failed(format!("failed to open channel: {}", e)))?
        };

        debug!(command = %command, "Running remote command");
        channel
            .exec(true, command)
            .await
            .map_err(|e| command_failed(e.to_string()))?;

        Ok(collect_output(&mut channel).await)
    }

    async fn listen(&self, addr: &BindAddress) -> TransportResult<Self::Listener> {
        let rx = self.routes.register(addr)?;

        let result = {
            let mut handle = self.handle.lock().await;
            if handle.is_closed() {
                Err(russh::Error::Disconnect)
            } else {
                handle.tcpip_forward(addr.host.clone(), addr.port as u32).await
            }
        };

        let port = match result {
            Ok(port) => port,
            Err(e) => {
                self.routes.remove(addr);
                let reason = match e {
                    russh::Error::RequestDenied => {
                        "request denied by relay (port in use or forwarding disabled)".to_string()
                    }
                    russh::Error::Disconnect => return Err(TransportError::SessionClosed),
                    other => other.to_string(),
                };
                return Err(TransportError::ListenDenied {
                    address: addr.to_string(),
                    reason,
                });
            }
        };

        // A zero port asks the relay to pick one; route on the port it chose
        let bound = if addr.port == 0 && port != 0 {
            let bound = BindAddress::new(addr.host.clone(), port as u16);
            self.routes.rebind(addr, &bound);
            bound
        } else {
            addr.clone()
        };

        info!(remote_endpoint = %bound, "Remote listener open");
        Ok(SshListener::new(
            bound,
            rx,
            self.handle.clone(),
            self.routes.clone(),
        ))
    }

    async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.routes.clear();
        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, reason, "en")
            .await
        {
            debug!(error = %e, "Disconnect from relay failed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self
                .handle
                .try_lock()
                .map(|handle| handle.is_closed())
                .unwrap_or(false)
    }

    fn remote_address(&self) -> &str {
        &self.address
    }
}

/// Drain a command channel until the relay closes it
async fn collect_output(channel: &mut Channel<Msg>) -> CommandOutput {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;

    // ExitStatus may arrive after Eof, so read until the channel is gone
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_status,
    }
}

/// Client-side event handler for one control session
pub struct TunnelHandler {
    address: String,
    host_key_policy: HostKeyPolicy,
    rejection: Arc<Mutex<Option<String>>>,
    routes: ForwardRoutes,
}

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.host_key_policy.verify(server_public_key) {
            Ok(fingerprint) => {
                if self.host_key_policy == HostKeyPolicy::AcceptAny {
                    warn!(
                        relay = %self.address,
                        fingerprint = %fingerprint,
                        "Host key accepted without verification (set REMOTE_HOST_KEY to pin it)"
                    );
                } else {
                    debug!(relay = %self.address, fingerprint = %fingerprint, "Host key verified");
                }
                Ok(true)
            }
            Err(reason) => {
                warn!(relay = %self.address, reason = %reason, "Host key rejected");
                if let Ok(mut rejection) = self.rejection.lock() {
                    *rejection = Some(reason);
                }
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            connected = %format!("{}:{}", connected_address, connected_port),
            originator = %format!("{}:{}", originator_address, originator_port),
            "Forwarded connection from relay"
        );

        let forwarded = ForwardedChannel {
            channel,
            originator_address: originator_address.to_string(),
            originator_port,
        };

        // Never await here: the session task must keep pumping packets
        if let Err(forwarded) = self
            .routes
            .dispatch(connected_address, connected_port, forwarded)
        {
            warn!(
                connected = %format!("{}:{}", connected_address, connected_port),
                "No listener for forwarded connection, closing it"
            );
            let _ = forwarded.channel.close().await;
        }

        Ok(())
    }
}

impl Drop for TunnelHandler {
    fn drop(&mut self) {
        // The session task owns the handler; wake every pending accept
        self.routes.clear();
    }
}
