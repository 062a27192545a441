//! Virtual TUN adapter
//!
//! An in-process userspace network stack whose traffic is carried as IP
//! packets over the WireGuard device. Exposes `dial` and `listen_packet`
//! to the rest of the system; internally a single actor owns the smoltcp
//! interface and pumps packets through the device channels.

mod device;
pub(crate) mod dns;
mod socket;
mod stack;

pub use socket::{ConnectedUdp, VirtualTcpStream, VirtualUdpSocket};

use crate::forward::{DialedConn, TunnelDialer};
use crate::proxy::{Network, ProxyError, ProxyStream};
use async_trait::async_trait;
use ipnet::IpNet;
use stack::{StackActor, StackCommand};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Depth of the IP packet channels between the stack and the device
const PACKET_CHANNEL_DEPTH: usize = 1024;

/// Depth of the command channel into the stack actor
const COMMAND_CHANNEL_DEPTH: usize = 64;

/// Netstack errors
#[derive(Debug, Error)]
pub enum StackError {
    #[error("destination unreachable: {0}")]
    Unreachable(String),

    #[error("connection refused")]
    Refused,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("name resolution failed: {0}")]
    NameResolution(String),

    #[error("datagram of {len} bytes exceeds MTU {mtu}")]
    PacketTooLarge { len: usize, mtu: usize },

    #[error("no interface address for this family")]
    NoAddress,

    #[error("network stack closed")]
    Closed,

    #[error("netstack setup failed: {0}")]
    Setup(String),
}

impl From<StackError> for ProxyError {
    fn from(err: StackError) -> Self {
        match err {
            StackError::Unreachable(_) => ProxyError::HostUnreachable,
            StackError::Refused => ProxyError::ConnectionRefused,
            StackError::ConnectTimeout => ProxyError::Timeout,
            StackError::NameResolution(host) => ProxyError::NameResolution(host),
            StackError::NoAddress => ProxyError::NetworkUnreachable,
            other => ProxyError::General(other.to_string()),
        }
    }
}

/// The WireGuard device's view of the stack: raw IP packets in both
/// directions. `outbound` carries packets the stack wants encapsulated;
/// `inbound` accepts decapsulated packets for delivery to virtual sockets.
pub struct TunChannel {
    pub outbound: mpsc::Receiver<Vec<u8>>,
    pub inbound: mpsc::Sender<Vec<u8>>,
}

/// Handle to the virtual network stack. Cheap to clone; shared read-only
/// by every connection handler.
#[derive(Clone)]
pub struct VirtualTun {
    cmd_tx: mpsc::Sender<StackCommand>,
    notify: Arc<Notify>,
    addresses: Vec<IpNet>,
    dns: Vec<IpAddr>,
    mtu: usize,
}

impl VirtualTun {
    /// Create the stack with the interface's address list, DNS servers and
    /// MTU, spawning the stack actor. Returns the handle plus the packet
    /// channel pair the WireGuard device binds to.
    pub fn new(
        addresses: Vec<IpNet>,
        dns: Vec<IpAddr>,
        mtu: usize,
        token: CancellationToken,
    ) -> Result<(Self, TunChannel), StackError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(PACKET_CHANNEL_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::channel(PACKET_CHANNEL_DEPTH);
        let notify = Arc::new(Notify::new());

        let actor = StackActor::new(
            addresses.clone(),
            mtu,
            cmd_rx,
            inbound_rx,
            outbound_tx,
            Arc::clone(&notify),
            token,
        )?;
        tokio::spawn(actor.run());
        debug!(?addresses, ?dns, mtu, "virtual netstack created");

        Ok((
            Self {
                cmd_tx,
                notify,
                addresses,
                dns,
                mtu,
            },
            TunChannel {
                outbound: outbound_rx,
                inbound: inbound_tx,
            },
        ))
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn dns_servers(&self) -> Vec<IpAddr> {
        self.dns.clone()
    }

    pub fn has_ipv4(&self) -> bool {
        self.addresses.iter().any(|net| net.addr().is_ipv4())
    }

    pub fn has_ipv6(&self) -> bool {
        self.addresses.iter().any(|net| net.addr().is_ipv6())
    }

    /// Open a TCP connection through the tunnel to a literal address
    pub async fn dial_tcp(&self, remote: SocketAddr) -> Result<VirtualTcpStream, StackError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(StackCommand::DialTcp {
                remote,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StackError::Closed)?;
        self.notify.notify_one();
        reply_rx.await.map_err(|_| StackError::Closed)?
    }

    /// Open a UDP flow through the tunnel with a fixed destination
    pub async fn dial_udp(&self, remote: SocketAddr) -> Result<ConnectedUdp, StackError> {
        let socket = self.listen_packet(None).await?;
        Ok(socket.connect(remote))
    }

    /// Bind a packet endpoint on the virtual stack
    pub async fn listen_packet(
        &self,
        local: Option<SocketAddr>,
    ) -> Result<VirtualUdpSocket, StackError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(StackCommand::BindUdp {
                local,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StackError::Closed)?;
        self.notify.notify_one();
        reply_rx.await.map_err(|_| StackError::Closed)?
    }

    /// Resolve a destination host for the given network, using the tunnel's
    /// DNS servers for non-literal names
    pub async fn resolve(&self, host: &str, network: Network) -> Result<IpAddr, StackError> {
        dns::resolve(self, host, network).await
    }
}

#[async_trait]
impl TunnelDialer for VirtualTun {
    async fn dial(
        &self,
        network: Network,
        host: &str,
        port: u16,
    ) -> Result<DialedConn, ProxyError> {
        let ip = self.resolve(host, network).await?;
        if !network.accepts(ip) {
            return Err(ProxyError::NameResolution(format!(
                "{} resolved to wrong family for {}",
                host, network
            )));
        }
        let remote = SocketAddr::new(ip, port);

        if network.is_udp() {
            let conn = self.dial_udp(remote).await?;
            let local_addr = conn.local_addr();
            Ok(DialedConn {
                stream: Box::new(conn) as Box<dyn ProxyStream>,
                local_addr,
            })
        } else {
            let stream = self.dial_tcp(remote).await?;
            let local_addr = stream.local_addr();
            Ok(DialedConn {
                stream: Box::new(stream) as Box<dyn ProxyStream>,
                local_addr,
            })
        }
    }
}
