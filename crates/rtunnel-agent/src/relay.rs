//! Connection relay between one remote peer and one local connection

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Bytes read per copy step in each direction
pub const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// One of the two copy directions of a relay pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    RemoteToLocal,
    LocalToRemote,
}

impl fmt::Display for RelayDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayDirection::RemoteToLocal => write!(f, "remote->local"),
            RelayDirection::LocalToRemote => write!(f, "local->remote"),
        }
    }
}

/// Outcome of one finished relay pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub relay_id: u64,
    pub remote_to_local: u64,
    pub local_to_remote: u64,
    /// The direction whose end tore the pair down
    pub first_finished: RelayDirection,
}

/// Relay bytes between `remote` and `local` until either direction ends.
///
/// Both directions run as separate tasks. As soon as one of them reaches
/// end-of-stream or fails, the other is cancelled and both connections are
/// dropped, so a half-closed pair never lingers. Copy errors are logged with
/// their direction and end only this pair.
pub async fn relay<R>(relay_id: u64, remote: R, local: TcpStream) -> RelayStats
where
    R: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (remote_read, remote_write) = tokio::io::split(remote);
    let (local_read, local_write) = local.into_split();

    let remote_to_local = Arc::new(AtomicU64::new(0));
    let local_to_remote = Arc::new(AtomicU64::new(0));

    let mut inbound = tokio::spawn(pump(
        remote_read,
        local_write,
        remote_to_local.clone(),
    ));
    let mut outbound = tokio::spawn(pump(
        local_read,
        remote_write,
        local_to_remote.clone(),
    ));

    let (first_finished, result) = tokio::select! {
        result = &mut inbound => {
            outbound.abort();
            let _ = outbound.await;
            (RelayDirection::RemoteToLocal, result)
        }
        result = &mut outbound => {
            inbound.abort();
            let _ = inbound.await;
            (RelayDirection::LocalToRemote, result)
        }
    };

    match result {
        Ok(Ok(())) => debug!(relay_id = relay_id, direction = %first_finished, "End of stream"),
        Ok(Err(e)) => warn!(
            relay_id = relay_id,
            direction = %first_finished,
            error = %e,
            "error while copy {}", first_finished
        ),
        Err(e) => warn!(
            relay_id = relay_id,
            direction = %first_finished,
            error = %e,
            "Copy task ended abnormally"
        ),
    }

    let stats = RelayStats {
        relay_id,
        remote_to_local: remote_to_local.load(Ordering::Relaxed),
        local_to_remote: local_to_remote.load(Ordering::Relaxed),
        first_finished,
    };

    info!(
        relay_id = relay_id,
        bytes_remote_to_local = stats.remote_to_local,
        bytes_local_to_remote = stats.local_to_remote,
        closed_by = %stats.first_finished,
        "Relay finished"
    );

    stats
}

/// Copy one direction until end-of-stream, then close the writer
async fn pump<Rd, Wr>(mut reader: Rd, mut writer: Wr, copied: Arc<AtomicU64>) -> std::io::Result<()>
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.shutdown().await
}
