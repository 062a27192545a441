//! Userspace WireGuard device over boringtun
//!
//! One `Tunn` per peer, one UDP socket to the world. Three background
//! tasks move packets: an outbound pump (netstack -> encapsulate -> peer
//! endpoint), an inbound pump (endpoint -> decapsulate -> netstack), and a
//! 250 ms timer driving retransmission, rekey and keepalive inside
//! boringtun. The AmneziaWG junk burst runs once, before the first
//! handshake initiation.

use super::ipc::{self, DeviceConfig, ObfuscationParams};
use super::WgError;
use crate::netstack::TunChannel;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Buffer headroom over the largest UDP payload, covering the WireGuard
/// transport overhead and handshake messages
const WG_BUFFER_SIZE: usize = 65536 + 256;

/// Timer tick driving boringtun's internal state machine
const TIMER_TICK: Duration = Duration::from_millis(250);

struct Peer {
    tunn: Mutex<Box<Tunn>>,
    public_key: [u8; 32],
    /// Endpoint as configured; may be a DNS name still to resolve
    endpoint_text: Option<String>,
    endpoint: RwLock<Option<SocketAddr>>,
    allowed_ips: Vec<IpNet>,
    keepalive: u16,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
}

struct Shared {
    socket: UdpSocket,
    peers: RwLock<Vec<Arc<Peer>>>,
    fwmark: AtomicU64,
}

/// The WireGuard device
pub struct Device {
    shared: Arc<Shared>,
    tun: Mutex<Option<TunChannel>>,
    obfuscation: RwLock<ObfuscationParams>,
    run_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    up: AtomicBool,
    closed: AtomicBool,
}

impl Device {
    /// Bind the transport socket and attach the netstack TUN channels.
    /// The device is configured with [`Device::ipc_set`] and started with
    /// [`Device::up`].
    pub async fn new(tun: TunChannel, token: CancellationToken) -> Result<Self, WgError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        debug!(local = %socket.local_addr()?, "WireGuard transport socket bound");

        Ok(Self {
            shared: Arc::new(Shared {
                socket,
                peers: RwLock::new(Vec::new()),
                fwmark: AtomicU64::new(0),
            }),
            tun: Mutex::new(Some(tun)),
            obfuscation: RwLock::new(ObfuscationParams::default()),
            run_token: token,
            tasks: Mutex::new(Vec::new()),
            up: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Apply an IPC configuration document: install the private key, the
    /// obfuscation parameters and one `Tunn` per peer.
    pub fn ipc_set(&self, doc: &str) -> Result<(), WgError> {
        let config = ipc::parse(doc)?;
        self.apply(config)
    }

    fn apply(&self, config: DeviceConfig) -> Result<(), WgError> {
        if !config.obfuscation.is_standard_framing() {
            return Err(WgError::Device(
                "unsupported obfuscation parameters: junk prefixes and header remapping are not implemented".into(),
            ));
        }
        *self.obfuscation.write() = config.obfuscation;
        self.shared
            .fwmark
            .store(config.fwmark as u64, Ordering::Relaxed);

        let private_key = StaticSecret::from(*config.private_key.as_bytes());
        let mut peers = Vec::with_capacity(config.peers.len());

        for (index, peer) in config.peers.iter().enumerate() {
            let public_key = PublicKey::from(*peer.public_key.as_bytes());
            let preshared = if peer.preshared_key.is_zero() {
                None
            } else {
                Some(*peer.preshared_key.as_bytes())
            };
            let keepalive = (peer.keepalive != 0).then_some(peer.keepalive);

            let tunn = Tunn::new(
                private_key.clone(),
                public_key,
                preshared,
                keepalive,
                index as u32,
                None,
            )
            .map_err(|e| WgError::Device(e.to_string()))?;

            // Literal endpoints resolve immediately; names wait for up()
            let endpoint = peer
                .endpoint
                .as_deref()
                .and_then(|text| text.parse::<SocketAddr>().ok());

            peers.push(Arc::new(Peer {
                tunn: Mutex::new(Box::new(tunn)),
                public_key: *peer.public_key.as_bytes(),
                endpoint_text: peer.endpoint.clone(),
                endpoint: RwLock::new(endpoint),
                allowed_ips: peer.allowed_ips.clone(),
                keepalive: peer.keepalive,
                tx_bytes: AtomicU64::new(0),
                rx_bytes: AtomicU64::new(0),
            }));
        }

        *self.shared.peers.write() = peers;
        debug!("device configuration applied");
        Ok(())
    }

    /// Bring the device up: resolve remaining endpoints, send the junk
    /// burst and handshake initiation, and start the pumps.
    pub async fn up(&self) -> Result<(), WgError> {
        if self.up.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tun = self
            .tun
            .lock()
            .take()
            .ok_or_else(|| WgError::Device("device already started".into()))?;

        self.resolve_endpoints().await;
        self.initiate_handshakes().await?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(outbound_loop(
            Arc::clone(&self.shared),
            tun.outbound,
            self.run_token.clone(),
        )));
        tasks.push(tokio::spawn(inbound_loop(
            Arc::clone(&self.shared),
            tun.inbound,
            self.run_token.clone(),
        )));
        tasks.push(tokio::spawn(timer_loop(
            Arc::clone(&self.shared),
            self.run_token.clone(),
        )));

        info!("WireGuard device up");
        Ok(())
    }

    /// Re-resolve textual endpoints through the host resolver. This is the
    /// device-layer retry behind the activation-time bootstrap resolution.
    async fn resolve_endpoints(&self) {
        let peers: Vec<Arc<Peer>> = self.shared.peers.read().clone();
        for peer in peers {
            if peer.endpoint.read().is_some() {
                continue;
            }
            let Some(text) = peer.endpoint_text.as_deref() else {
                continue;
            };
            match tokio::net::lookup_host(text).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        debug!(endpoint = text, resolved = %addr, "peer endpoint resolved");
                        *peer.endpoint.write() = Some(addr);
                    }
                }
                Err(err) => {
                    warn!(endpoint = text, "failed to resolve peer endpoint: {}", err);
                }
            }
        }
    }

    /// Junk burst followed by a handshake initiation, per peer
    async fn initiate_handshakes(&self) -> Result<(), WgError> {
        let obfuscation = *self.obfuscation.read();
        let peers: Vec<Arc<Peer>> = self.shared.peers.read().clone();

        for peer in peers {
            let Some(endpoint) = *peer.endpoint.read() else {
                warn!(
                    peer = %hex_prefix(&peer.public_key),
                    "peer has no usable endpoint, skipping handshake"
                );
                continue;
            };

            let mut rng = rand::rngs::OsRng;
            for _ in 0..obfuscation.jc {
                let len = sample_junk_len(&mut rng, obfuscation.jmin, obfuscation.jmax);
                let mut junk = vec![0u8; len];
                rng.fill_bytes(&mut junk);
                self.shared.socket.send_to(&junk, endpoint).await?;
            }
            trace!(count = obfuscation.jc, %endpoint, "junk burst sent");

            let mut out = vec![0u8; WG_BUFFER_SIZE];
            let initiation = {
                let mut tunn = peer.tunn.lock();
                match tunn.format_handshake_initiation(&mut out, false) {
                    TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
                    TunnResult::Err(e) => {
                        return Err(WgError::Device(format!(
                            "handshake initiation failed: {:?}",
                            e
                        )))
                    }
                    _ => None,
                }
            };
            if let Some(data) = initiation {
                debug!(%endpoint, bytes = data.len(), "sending handshake initiation");
                self.shared.socket.send_to(&data, endpoint).await?;
            }
        }

        Ok(())
    }

    /// Render UAPI-style status for every peer, including the
    /// `last_handshake_time_sec` lines the activation sequence polls.
    pub fn ipc_get(&self) -> String {
        let mut out = String::new();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        for peer in self.shared.peers.read().iter() {
            out.push_str(&format!("public_key={}\n", hex::encode(peer.public_key)));
            if let Some(endpoint) = *peer.endpoint.read() {
                out.push_str(&format!("endpoint={}\n", endpoint));
            }

            let last_handshake = {
                let tunn = peer.tunn.lock();
                tunn.time_since_last_handshake()
                    .map(|since| now.saturating_sub(since.as_secs()))
                    .unwrap_or(0)
            };
            out.push_str(&format!("last_handshake_time_sec={}\n", last_handshake));
            out.push_str("last_handshake_time_nsec=0\n");
            out.push_str(&format!(
                "tx_bytes={}\n",
                peer.tx_bytes.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "rx_bytes={}\n",
                peer.rx_bytes.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "persistent_keepalive_interval={}\n",
                peer.keepalive
            ));
            for prefix in &peer.allowed_ips {
                out.push_str(&format!("allowed_ip={}\n", prefix));
            }
        }
        out.push_str("errno=0\n");
        out
    }

    /// Stop the pumps. Safe to call more than once.
    pub fn down(&self) {
        if self.up.swap(false, Ordering::SeqCst) {
            info!("WireGuard device down");
        }
        self.run_token.cancel();
    }

    /// Tear the device down entirely. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.down();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("WireGuard device closed");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

fn hex_prefix(key: &[u8; 32]) -> String {
    hex::encode(&key[..4])
}

fn sample_junk_len<R: RngCore>(rng: &mut R, jmin: u16, jmax: u16) -> usize {
    let (lo, hi) = if jmin <= jmax {
        (jmin as u32, jmax as u32)
    } else {
        (jmax as u32, jmin as u32)
    };
    (lo + rng.next_u32() % (hi - lo + 1)) as usize
}

/// Destination IP of a raw IP packet, for routing to a peer
fn dst_ip(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&packet[16..20]);
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[24..40]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Longest-prefix match over every peer's allowed IPs, falling back to the
/// first peer for destinations nothing claims
fn route(peers: &[Arc<Peer>], dst: IpAddr) -> Option<Arc<Peer>> {
    let mut best: Option<(u8, Arc<Peer>)> = None;
    for peer in peers {
        for net in &peer.allowed_ips {
            if net.contains(&dst) {
                let len = net.prefix_len();
                if best.as_ref().map(|(l, _)| len >= *l).unwrap_or(true) {
                    best = Some((len, Arc::clone(peer)));
                }
            }
        }
    }
    best.map(|(_, peer)| peer)
        .or_else(|| peers.first().cloned())
}

/// Peer owning a source address, falling back to the first peer so a
/// roaming peer's packets still reach its `Tunn`
fn peer_for_source(peers: &[Arc<Peer>], from: SocketAddr) -> Option<Arc<Peer>> {
    peers
        .iter()
        .find(|peer| *peer.endpoint.read() == Some(from))
        .cloned()
        .or_else(|| peers.first().cloned())
}

async fn outbound_loop(
    shared: Arc<Shared>,
    mut outbound: tokio::sync::mpsc::Receiver<Vec<u8>>,
    token: CancellationToken,
) {
    let mut out = vec![0u8; WG_BUFFER_SIZE];
    loop {
        let packet = tokio::select! {
            _ = token.cancelled() => break,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        let Some(dst) = dst_ip(&packet) else {
            trace!("dropping malformed outbound packet");
            continue;
        };
        let peers: Vec<Arc<Peer>> = shared.peers.read().clone();
        let Some(peer) = route(&peers, dst) else {
            trace!(%dst, "no peer routes this destination");
            continue;
        };
        let Some(endpoint) = *peer.endpoint.read() else {
            trace!(%dst, "peer endpoint unknown, dropping packet");
            continue;
        };

        let encapsulated = {
            let mut tunn = peer.tunn.lock();
            match tunn.encapsulate(&packet, &mut out) {
                TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
                TunnResult::Err(e) => {
                    warn!("encapsulation error: {:?}", e);
                    None
                }
                _ => None,
            }
        };

        if let Some(data) = encapsulated {
            peer.tx_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
            if let Err(err) = shared.socket.send_to(&data, endpoint).await {
                warn!(%endpoint, "transport send failed: {}", err);
            }
        }
    }
    debug!("outbound pump stopped");
}

async fn inbound_loop(
    shared: Arc<Shared>,
    inbound: tokio::sync::mpsc::Sender<Vec<u8>>,
    token: CancellationToken,
) {
    let mut recv = vec![0u8; WG_BUFFER_SIZE];
    let mut out = vec![0u8; WG_BUFFER_SIZE];

    loop {
        let (n, from) = tokio::select! {
            _ = token.cancelled() => break,
            received = shared.socket.recv_from(&mut recv) => match received {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("transport recv failed: {}", err);
                    continue;
                }
            },
        };

        let peers: Vec<Arc<Peer>> = shared.peers.read().clone();
        let Some(peer) = peer_for_source(&peers, from) else {
            continue;
        };
        peer.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);

        let mut to_network: Vec<Vec<u8>> = Vec::new();
        let mut to_tunnel: Vec<Vec<u8>> = Vec::new();
        {
            let mut tunn = peer.tunn.lock();
            match tunn.decapsulate(Some(from.ip()), &recv[..n], &mut out) {
                TunnResult::WriteToNetwork(data) => {
                    to_network.push(data.to_vec());
                    // Drain whatever the session queued behind the handshake
                    loop {
                        match tunn.decapsulate(None, &[], &mut out) {
                            TunnResult::WriteToNetwork(data) => to_network.push(data.to_vec()),
                            _ => break,
                        }
                    }
                }
                TunnResult::WriteToTunnelV4(data, _) => to_tunnel.push(data.to_vec()),
                TunnResult::WriteToTunnelV6(data, _) => to_tunnel.push(data.to_vec()),
                TunnResult::Done => {}
                TunnResult::Err(e) => trace!("decapsulation error: {:?}", e),
            }
        }

        // Roaming: the latest good source becomes the peer endpoint
        if !to_network.is_empty() || !to_tunnel.is_empty() {
            let mut endpoint = peer.endpoint.write();
            if *endpoint != Some(from) {
                debug!(%from, "peer endpoint updated");
                *endpoint = Some(from);
            }
        }

        for data in to_network {
            if let Err(err) = shared.socket.send_to(&data, from).await {
                warn!("transport send failed: {}", err);
            }
        }
        for data in to_tunnel {
            if inbound.try_send(data).is_err() {
                trace!("inbound packet queue full, dropping");
            }
        }
    }
    debug!("inbound pump stopped");
}

async fn timer_loop(shared: Arc<Shared>, token: CancellationToken) {
    let mut out = vec![0u8; WG_BUFFER_SIZE];
    let mut ticker = tokio::time::interval(TIMER_TICK);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let peers: Vec<Arc<Peer>> = shared.peers.read().clone();
        for peer in peers {
            let Some(endpoint) = *peer.endpoint.read() else {
                continue;
            };
            let pending = {
                let mut tunn = peer.tunn.lock();
                match tunn.update_timers(&mut out) {
                    TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
                    TunnResult::Err(e) => {
                        trace!("timer error: {:?}", e);
                        None
                    }
                    _ => None,
                }
            };
            if let Some(data) = pending {
                if let Err(err) = shared.socket.send_to(&data, endpoint).await {
                    warn!(%endpoint, "timer send failed: {}", err);
                }
            }
        }
    }
    debug!("timer pump stopped");
}
