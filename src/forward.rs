//! Forwarding handler
//!
//! Bridges a proxy-side connection to a tunnel-side connection: dials the
//! destination through the tunnel, then runs one copier per direction until
//! either side closes. The forwarder has no knowledge of SOCKS or HTTP; it
//! accepts only the [`ProxyRequest`] contract.

use crate::proxy::{Network, ProxyError, ProxyRequest, ProxyStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Copy buffer size, one buffer per copier direction
pub const BUFFER_SIZE: usize = 65536;

/// Idle timeout applied per direction for UDP flows
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// A destination dialed through the tunnel
pub struct DialedConn {
    pub stream: Box<dyn ProxyStream>,
    /// Tunnel-side bound address, reported back in SOCKS success replies
    pub local_addr: SocketAddr,
}

/// The seam between proxy handlers and the virtual network stack. The
/// gateway installs the netstack implementation; tests install a loopback
/// dialer over the host network.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn dial(
        &self,
        network: Network,
        host: &str,
        port: u16,
    ) -> Result<DialedConn, ProxyError>;
}

/// Process-wide buffer allocator. Each copier acquires one buffer for its
/// lifetime and releases it on exit.
pub struct BufferPool {
    size: usize,
    slab: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            slab: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> Vec<u8> {
        self.slab
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size])
    }

    pub fn put(&self, buf: Vec<u8>) {
        // Only same-sized buffers go back
        if buf.len() == self.size {
            self.slab.lock().push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BUFFER_SIZE)
    }
}

/// Dials through the tunnel and pumps bytes between client and destination
pub struct Forwarder {
    dialer: Arc<dyn TunnelDialer>,
    pool: Arc<BufferPool>,
    token: CancellationToken,
}

impl Forwarder {
    pub fn new(dialer: Arc<dyn TunnelDialer>, token: CancellationToken) -> Self {
        Self {
            dialer,
            pool: Arc::new(BufferPool::default()),
            token,
        }
    }

    /// Dial a destination through the tunnel. Exposed separately from
    /// [`Forwarder::handle`] so protocol handlers can map dial failures onto
    /// their rejection replies before any success bytes go out.
    pub async fn dial(
        &self,
        network: Network,
        host: &str,
        port: u16,
    ) -> Result<DialedConn, ProxyError> {
        self.dialer.dial(network, host, port).await
    }

    /// Full handler: dial `req.destination`, then bridge
    pub async fn handle(&self, req: ProxyRequest) -> Result<(), ProxyError> {
        debug!(
            network = %req.network,
            destination = %req.destination,
            "forwarding connection"
        );
        let upstream = self.dial(req.network, &req.host, req.port).await?;
        self.bridge(req.stream, upstream.stream, req.network).await
    }

    /// Bidirectional copy between an established client stream and an
    /// established upstream stream. UDP flavors get a 15 s per-direction
    /// idle timeout; TCP runs without one.
    pub async fn bridge(
        &self,
        client: Box<dyn ProxyStream>,
        upstream: Box<dyn ProxyStream>,
        network: Network,
    ) -> Result<(), ProxyError> {
        let idle = network.is_udp().then_some(UDP_IDLE_TIMEOUT);
        pump(client, upstream, idle, &self.pool, &self.token).await
    }

    pub fn pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.pool)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Raw bidirectional pump, also used by the SOCKS BIND paths which bridge
/// two already-open connections without a tunnel dial.
pub async fn pump(
    a: Box<dyn ProxyStream>,
    b: Box<dyn ProxyStream>,
    idle: Option<Duration>,
    pool: &Arc<BufferPool>,
    token: &CancellationToken,
) -> Result<(), ProxyError> {
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    // The first copier to finish cancels this token; the other copier then
    // shuts its write half and returns.
    let stop = token.child_token();
    let first_error: Arc<Mutex<Option<std::io::Error>>> = Arc::new(Mutex::new(None));

    let forward = tokio::spawn(copy_direction(
        a_read,
        b_write,
        idle,
        Arc::clone(pool),
        stop.clone(),
        Arc::clone(&first_error),
    ));
    let backward = tokio::spawn(copy_direction(
        b_read,
        a_write,
        idle,
        Arc::clone(pool),
        stop.clone(),
        Arc::clone(&first_error),
    ));

    let _ = forward.await;
    let _ = backward.await;

    let err = first_error.lock().take();
    match err {
        Some(err) => {
            warn!("forwarding ended with error: {}", err);
            Err(ProxyError::Io(err))
        }
        None => Ok(()),
    }
}

/// One direction of the pump. The idle timeout is a read deadline re-armed
/// before every read; writes are not separately timed. `ECONNRESET` and
/// idle expiry both count as clean closure.
async fn copy_direction<R, W>(
    mut src: R,
    mut dst: W,
    idle: Option<Duration>,
    pool: Arc<BufferPool>,
    stop: CancellationToken,
    first_error: Arc<Mutex<Option<std::io::Error>>>,
) where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = pool.get();

    loop {
        let read = async {
            match idle {
                Some(timeout) => match tokio::time::timeout(timeout, src.read(&mut buf)).await {
                    Ok(result) => result.map(Some),
                    // Idle expiry: the association is dead, close cleanly
                    Err(_) => Ok(None),
                },
                None => src.read(&mut buf).await.map(Some),
            }
        };

        let n = tokio::select! {
            _ = stop.cancelled() => break,
            result = read => match result {
                Ok(Some(0)) | Ok(None) => break,
                Ok(Some(n)) => n,
                Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => {
                    debug!("connection reset by peer, treating as clean close");
                    break;
                }
                Err(err) => {
                    record_error(&first_error, err);
                    break;
                }
            },
        };

        if let Err(err) = dst.write_all(&buf[..n]).await {
            record_error(&first_error, err);
            break;
        }
    }

    let _ = dst.shutdown().await;
    stop.cancel();
    pool.put(buf);
}

fn record_error(slot: &Arc<Mutex<Option<std::io::Error>>>, err: std::io::Error) {
    let mut guard = slot.lock();
    if guard.is_none() {
        *guard = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn pool_recycles_buffers() {
        let pool = BufferPool::new(16);
        let buf = pool.get();
        assert_eq!(buf.len(), 16);
        pool.put(buf);
        assert_eq!(pool.slab.lock().len(), 1);
        let _ = pool.get();
        assert_eq!(pool.slab.lock().len(), 0);
    }

    #[test]
    fn pool_drops_foreign_buffers() {
        let pool = BufferPool::new(16);
        pool.put(vec![0u8; 8]);
        assert!(pool.slab.lock().is_empty());
    }

    #[tokio::test]
    async fn pump_copies_both_directions() {
        let (client_ours, mut client_theirs) = tokio::io::duplex(1024);
        let (upstream_ours, mut upstream_theirs) = tokio::io::duplex(1024);

        let pool = Arc::new(BufferPool::default());
        let token = CancellationToken::new();
        let task = tokio::spawn(async move {
            pump(
                Box::new(client_ours) as Box<dyn ProxyStream>,
                Box::new(upstream_ours) as Box<dyn ProxyStream>,
                None,
                &pool,
                &token,
            )
            .await
        });

        client_theirs.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_theirs.write_all(b"pong").await.unwrap();
        client_theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one side terminates the pump
        drop(client_theirs);
        drop(upstream_theirs);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_timeout_terminates_pump() {
        let (client_ours, client_theirs) = tokio::io::duplex(1024);
        let (upstream_ours, upstream_theirs) = tokio::io::duplex(1024);

        let pool = Arc::new(BufferPool::default());
        let token = CancellationToken::new();
        let started = Instant::now();
        let result = pump(
            Box::new(client_ours) as Box<dyn ProxyStream>,
            Box::new(upstream_ours) as Box<dyn ProxyStream>,
            Some(Duration::from_millis(100)),
            &pool,
            &token,
        )
        .await;

        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(client_theirs);
        drop(upstream_theirs);
    }

    #[tokio::test]
    async fn cancellation_terminates_pump() {
        let (client_ours, client_theirs) = tokio::io::duplex(1024);
        let (upstream_ours, upstream_theirs) = tokio::io::duplex(1024);

        let pool = Arc::new(BufferPool::default());
        let token = CancellationToken::new();
        let pump_token = token.clone();
        let task = tokio::spawn(async move {
            pump(
                Box::new(client_ours) as Box<dyn ProxyStream>,
                Box::new(upstream_ours) as Box<dyn ProxyStream>,
                None,
                &pool,
                &pump_token,
            )
            .await
        });

        token.cancel();
        task.await.unwrap().unwrap();
        drop(client_theirs);
        drop(upstream_theirs);
    }
}
