//! Remote listeners backed by SSH `tcpip-forward` requests

use crate::connection::TunnelHandler;
use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelStream};
use rtunnel_transport::{
    BindAddress, PeerInfo, RemoteListener, TransportError, TransportResult,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

/// A `forwarded-tcpip` channel opened by the relay for one inbound peer
pub(crate) struct ForwardedChannel {
    pub channel: Channel<Msg>,
    pub originator_address: String,
    pub originator_port: u32,
}

/// Maps remote bind addresses to the listener waiting on them
///
/// Shared between the session handle and the handler running inside the
/// session task. Only held for short, non-async critical sections.
#[derive(Clone, Default)]
pub(crate) struct ForwardRoutes {
    inner: Arc<Mutex<HashMap<BindAddress, mpsc::UnboundedSender<ForwardedChannel>>>>,
}

impl ForwardRoutes {
    fn lock(&self) -> MutexGuard<'_, HashMap<BindAddress, mpsc::UnboundedSender<ForwardedChannel>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `addr` for a new listener
    pub fn register(
        &self,
        addr: &BindAddress,
    ) -> TransportResult<mpsc::UnboundedReceiver<ForwardedChannel>> {
        let mut routes = self.lock();
        if routes.contains_key(addr) {
            return Err(TransportError::ListenDenied {
                address: addr.to_string(),
                reason: "already listening on this address in this session".to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(addr.clone(), tx);
        Ok(rx)
    }

    pub fn rebind(&self, from: &BindAddress, to: &BindAddress) {
        let mut routes = self.lock();
        if let Some(tx) = routes.remove(from) {
            routes.insert(to.clone(), tx);
        }
    }

    pub fn remove(&self, addr: &BindAddress) {
        self.lock().remove(addr);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Hand a forwarded channel to the listener bound on `(address, port)`.
    ///
    /// Relays may report the bind address differently than it was requested
    /// (`localhost` vs `127.0.0.1`), so an unmatched address falls back to the
    /// only listener on that port. The channel is handed back if nobody wants it.
    pub fn dispatch(
        &self,
        address: &str,
        port: u32,
        forwarded: ForwardedChannel,
    ) -> Result<(), ForwardedChannel> {
        let Ok(port) = u16::try_from(port) else {
            return Err(forwarded);
        };

        let routes = self.lock();
        let exact = BindAddress::new(address, port);
        let tx = routes.get(&exact).or_else(|| {
            let mut same_port = routes.iter().filter(|(addr, _)| addr.port == port);
            match (same_port.next(), same_port.next()) {
                (Some((_, tx)), None) => Some(tx),
                _ => None,
            }
        });

        match tx {
            Some(tx) => tx.send(forwarded).map_err(|e| e.0),
            None => Err(forwarded),
        }
    }
}

/// A listening socket on the relay host, reachable through one SSH session
pub struct SshListener {
    addr: BindAddress,
    rx: mpsc::UnboundedReceiver<ForwardedChannel>,
    handle: Arc<AsyncMutex<Handle<TunnelHandler>>>,
    routes: ForwardRoutes,
    closed: bool,
}

impl SshListener {
    pub(crate) fn new(
        addr: BindAddress,
        rx: mpsc::UnboundedReceiver<ForwardedChannel>,
        handle: Arc<AsyncMutex<Handle<TunnelHandler>>>,
        routes: ForwardRoutes,
    ) -> Self {
        Self {
            addr,
            rx,
            handle,
            routes,
            closed: false,
        }
    }
}

impl fmt::Debug for SshListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshListener")
            .field("addr", &self.addr)
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl RemoteListener for SshListener {
    type Stream = ChannelStream<Msg>;

    async fn accept(&mut self) -> TransportResult<(Self::Stream, PeerInfo)> {
        let forwarded = self.rx.recv().await.ok_or(TransportError::SessionClosed)?;
        let peer = PeerInfo {
            originator_address: forwarded.originator_address,
            originator_port: forwarded.originator_port,
        };
        Ok((forwarded.channel.into_stream(), peer))
    }

    fn bind_address(&self) -> &BindAddress {
        &self.addr
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        self.routes.remove(&self.addr);

        let handle = self.handle.lock().await;
        if handle.is_closed() {
            return;
        }
        match handle
            .cancel_tcpip_forward(self.addr.host.clone(), self.addr.port as u32)
            .await
        {
            Ok(()) => info!(remote_endpoint = %self.addr, "Remote listener closed"),
            Err(e) => debug!(remote_endpoint = %self.addr, error = %e, "cancel-tcpip-forward failed"),
        }
    }
}

impl Drop for SshListener {
    fn drop(&mut self) {
        if !self.closed {
            self.routes.remove(&self.addr);
        }
    }
}
