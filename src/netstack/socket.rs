//! Virtual socket handles
//!
//! Thin async wrappers over the channels that connect user code to the
//! stack actor. `VirtualTcpStream` behaves like a `TcpStream`;
//! `VirtualUdpSocket` offers `send_to`/`recv_from` and can be connected
//! into a stream-shaped `ConnectedUdp` for the forwarder.

use super::StackError;
use bytes::Bytes;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::PollSender;

/// A TCP connection carried by the virtual stack
pub struct VirtualTcpStream {
    pub(crate) rx: mpsc::Receiver<Bytes>,
    pub(crate) leftover: Option<Bytes>,
    pub(crate) tx: PollSender<Bytes>,
    pub(crate) notify: Arc<Notify>,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: SocketAddr,
}

impl VirtualTcpStream {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl AsyncRead for VirtualTcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(mut chunk) = self.leftover.take() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk.split_to(n));
            if !chunk.is_empty() {
                self.leftover = Some(chunk);
            }
            return Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(mut chunk)) => {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk.split_to(n));
                if !chunk.is_empty() {
                    self.leftover = Some(chunk);
                }
                // The actor may be holding back data for channel room
                self.notify.notify_one();
                Poll::Ready(Ok(()))
            }
            // Sender dropped: remote side finished
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for VirtualTcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let chunk = Bytes::copy_from_slice(data);
                if self.tx.send_item(chunk).is_err() {
                    return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
                }
                self.notify.notify_one();
                Poll::Ready(Ok(data.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Closing the channel queues a FIN in the actor
        self.tx.close();
        self.notify.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl Drop for VirtualTcpStream {
    fn drop(&mut self) {
        self.notify.notify_one();
    }
}

/// A UDP endpoint on the virtual stack
pub struct VirtualUdpSocket {
    pub(crate) tx: mpsc::Sender<(Bytes, SocketAddr)>,
    pub(crate) rx: tokio::sync::Mutex<mpsc::Receiver<(Bytes, SocketAddr)>>,
    pub(crate) notify: Arc<Notify>,
    pub(crate) local_addr: SocketAddr,
    pub(crate) max_payload: usize,
}

impl VirtualUdpSocket {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one datagram. Payloads larger than the interface MTU allows are
    /// rejected rather than fragmented.
    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<(), StackError> {
        if payload.len() > self.max_payload {
            return Err(StackError::PacketTooLarge {
                len: payload.len(),
                mtu: self.max_payload,
            });
        }
        self.tx
            .send((Bytes::copy_from_slice(payload), target))
            .await
            .map_err(|_| StackError::Closed)?;
        self.notify.notify_one();
        Ok(())
    }

    /// Receive one datagram, truncating to the buffer if needed
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), StackError> {
        let (data, from) = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(StackError::Closed)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.notify.notify_one();
        Ok((n, from))
    }

    /// Fix a default destination, producing a stream-shaped connection for
    /// the forwarder. Datagrams from other sources are dropped.
    pub fn connect(self, remote: SocketAddr) -> ConnectedUdp {
        ConnectedUdp {
            rx: self.rx.into_inner(),
            tx: PollSender::new(self.tx),
            notify: self.notify,
            local_addr: self.local_addr,
            remote,
            max_payload: self.max_payload,
        }
    }
}

/// A connected UDP flow with datagram-per-read stream semantics
pub struct ConnectedUdp {
    rx: mpsc::Receiver<(Bytes, SocketAddr)>,
    tx: PollSender<(Bytes, SocketAddr)>,
    notify: Arc<Notify>,
    local_addr: SocketAddr,
    remote: SocketAddr,
    max_payload: usize,
}

impl ConnectedUdp {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl AsyncRead for ConnectedUdp {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some((data, from))) => {
                    if from != self.remote {
                        continue;
                    }
                    // Datagram semantics: oversize payloads truncate
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    self.notify.notify_one();
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for ConnectedUdp {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if data.len() > self.max_payload {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("datagram of {} bytes exceeds MTU", data.len()),
            )));
        }
        match self.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let remote = self.remote;
                if self
                    .tx
                    .send_item((Bytes::copy_from_slice(data), remote))
                    .is_err()
                {
                    return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
                }
                self.notify.notify_one();
                Poll::Ready(Ok(data.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.tx.close();
        self.notify.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl Drop for ConnectedUdp {
    fn drop(&mut self) {
        self.notify.notify_one();
    }
}
