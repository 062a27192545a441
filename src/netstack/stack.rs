//! The stack actor
//!
//! A single task owns the smoltcp `Interface`, the socket set and the
//! channel-backed device. Everything else talks to it through commands and
//! per-socket byte channels, plus a shared `Notify` that wakes the actor
//! whenever a socket half has produced or consumed data.

use super::device::ChannelDevice;
use super::socket::{VirtualTcpStream, VirtualUdpSocket};
use super::StackError;
use bytes::Bytes;
use ipnet::IpNet;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, Ipv4Address, Ipv6Address};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace, warn};

/// TCP socket buffer size, each direction
const TCP_BUFFER_SIZE: usize = 65535;

/// UDP packet buffer: datagram slots and byte capacity
const UDP_META_SLOTS: usize = 32;
const UDP_BUFFER_SIZE: usize = 65535;

/// Chunk channel depth between a socket and its handle
const CHANNEL_DEPTH: usize = 32;

/// Virtual connect deadline
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// First ephemeral port handed out by the allocator
const EPHEMERAL_PORT_START: u16 = 49152;

/// IPv4/IPv6 header overhead subtracted from the MTU for UDP payload checks
pub(crate) const UDP_HEADER_OVERHEAD: usize = 48;

pub(crate) fn to_smol(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address(v4.octets())),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address(v6.octets())),
    }
}

pub(crate) fn from_smol(ip: IpAddress) -> IpAddr {
    match ip {
        IpAddress::Ipv4(v4) => IpAddr::V4(Ipv4Addr::from(v4.0)),
        IpAddress::Ipv6(v6) => IpAddr::V6(Ipv6Addr::from(v6.0)),
    }
}

pub(crate) enum StackCommand {
    DialTcp {
        remote: SocketAddr,
        reply: oneshot::Sender<Result<VirtualTcpStream, StackError>>,
    },
    BindUdp {
        local: Option<SocketAddr>,
        reply: oneshot::Sender<Result<VirtualUdpSocket, StackError>>,
    },
}

struct TcpEntry {
    to_stack: mpsc::Receiver<Bytes>,
    pending: Option<Bytes>,
    from_stack: Option<mpsc::Sender<Bytes>>,
    connect: Option<ConnectState>,
    fin_queued: bool,
}

struct ConnectState {
    reply: oneshot::Sender<Result<VirtualTcpStream, StackError>>,
    stream: Option<VirtualTcpStream>,
    deadline: Instant,
}

struct UdpEntry {
    to_stack: mpsc::Receiver<(Bytes, SocketAddr)>,
    pending: Option<(Bytes, SocketAddr)>,
    from_stack: mpsc::Sender<(Bytes, SocketAddr)>,
}

pub(crate) struct StackActor {
    device: ChannelDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    tcp_entries: HashMap<SocketHandle, TcpEntry>,
    udp_entries: HashMap<SocketHandle, UdpEntry>,
    cmd_rx: mpsc::Receiver<StackCommand>,
    packet_rx: mpsc::Receiver<Vec<u8>>,
    packet_tx: mpsc::Sender<Vec<u8>>,
    notify: Arc<Notify>,
    token: CancellationToken,
    addresses: Vec<IpNet>,
    mtu: usize,
    next_port: u16,
}

impl StackActor {
    /// Build the interface and actor state. `packet_rx` carries inbound
    /// (decapsulated) IP packets from the WireGuard device; `packet_tx`
    /// carries outbound packets to it.
    pub(crate) fn new(
        addresses: Vec<IpNet>,
        mtu: usize,
        cmd_rx: mpsc::Receiver<StackCommand>,
        packet_rx: mpsc::Receiver<Vec<u8>>,
        packet_tx: mpsc::Sender<Vec<u8>>,
        notify: Arc<Notify>,
        token: CancellationToken,
    ) -> Result<Self, StackError> {
        let mut device = ChannelDevice::new(mtu);
        let config = Config::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, SmolInstant::now());

        iface.update_ip_addrs(|ip_addrs| {
            for net in &addresses {
                let cidr = IpCidr::new(to_smol(net.addr()), net.prefix_len());
                if ip_addrs.push(cidr).is_err() {
                    warn!(addr = %net, "interface address table full, skipping");
                }
            }
        });

        let has_v4 = addresses.iter().any(|a| a.addr().is_ipv4());
        let has_v6 = addresses.iter().any(|a| a.addr().is_ipv6());
        if has_v4 {
            iface
                .routes_mut()
                .add_default_ipv4_route(Ipv4Address::new(0, 0, 0, 1))
                .map_err(|_| StackError::Setup("ipv4 route table full".into()))?;
        }
        if has_v6 {
            iface
                .routes_mut()
                .add_default_ipv6_route(Ipv6Address::new(0, 0, 0, 0, 0, 0, 0, 1))
                .map_err(|_| StackError::Setup("ipv6 route table full".into()))?;
        }

        Ok(Self {
            device,
            iface,
            sockets: SocketSet::new(Vec::new()),
            tcp_entries: HashMap::new(),
            udp_entries: HashMap::new(),
            cmd_rx,
            packet_rx,
            packet_tx,
            notify,
            token,
            addresses,
            mtu,
            next_port: EPHEMERAL_PORT_START,
        })
    }

    pub(crate) async fn run(mut self) {
        debug!("stack actor started");
        loop {
            while let Ok(packet) = self.packet_rx.try_recv() {
                self.device.push_rx(packet);
            }

            let now = SmolInstant::now();
            self.iface.poll(now, &mut self.device, &mut self.sockets);
            self.service_tcp();
            self.service_udp();
            self.iface
                .poll(SmolInstant::now(), &mut self.device, &mut self.sockets);

            while let Some(packet) = self.device.pop_tx() {
                // A full queue behaves like a NIC dropping frames
                if self.packet_tx.try_send(packet).is_err() {
                    trace!("outbound packet queue full, dropping");
                }
            }

            let delay = self
                .iface
                .poll_delay(SmolInstant::now(), &self.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(Duration::from_secs(1))
                .min(Duration::from_secs(1));

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = self.notify.notified() => {}
                packet = self.packet_rx.recv() => {
                    match packet {
                        Some(packet) => self.device.push_rx(packet),
                        // Device side gone; keep serving until cancelled
                        None => tokio::time::sleep(delay).await,
                    }
                }
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                _ = tokio::time::sleep(delay), if !self.device.has_rx() => {}
            }
        }

        for (handle, _) in self.tcp_entries.drain() {
            self.sockets.get_mut::<tcp::Socket>(handle).abort();
        }
        debug!("stack actor stopped");
    }

    fn handle_command(&mut self, command: StackCommand) {
        match command {
            StackCommand::DialTcp { remote, reply } => self.dial_tcp(remote, reply),
            StackCommand::BindUdp { local, reply } => self.bind_udp(local, reply),
        }
    }

    fn dial_tcp(
        &mut self,
        remote: SocketAddr,
        reply: oneshot::Sender<Result<VirtualTcpStream, StackError>>,
    ) {
        let local_ip = match self.local_ip_for(remote.ip()) {
            Some(ip) => ip,
            None => {
                let _ = reply.send(Err(StackError::NoAddress));
                return;
            }
        };
        let port = self.alloc_port();

        let rx_buffer = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let tx_buffer = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let mut socket = tcp::Socket::new(rx_buffer, tx_buffer);
        socket.set_nagle_enabled(false);

        let remote_endpoint = IpEndpoint::new(to_smol(remote.ip()), remote.port());
        if let Err(err) = socket.connect(self.iface.context(), remote_endpoint, port) {
            let _ = reply.send(Err(StackError::Unreachable(err.to_string())));
            return;
        }

        let (to_stack_tx, to_stack_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let (from_stack_tx, from_stack_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);

        let stream = VirtualTcpStream {
            rx: from_stack_rx,
            leftover: None,
            tx: PollSender::new(to_stack_tx),
            notify: Arc::clone(&self.notify),
            local_addr: SocketAddr::new(local_ip, port),
            peer_addr: remote,
        };

        let handle = self.sockets.add(socket);
        self.tcp_entries.insert(
            handle,
            TcpEntry {
                to_stack: to_stack_rx,
                pending: None,
                from_stack: Some(from_stack_tx),
                connect: Some(ConnectState {
                    reply,
                    stream: Some(stream),
                    deadline: Instant::now() + CONNECT_TIMEOUT,
                }),
                fin_queued: false,
            },
        );
        trace!(%remote, port, "virtual TCP connect started");
    }

    fn bind_udp(
        &mut self,
        local: Option<SocketAddr>,
        reply: oneshot::Sender<Result<VirtualUdpSocket, StackError>>,
    ) {
        let (local_ip, requested_port) = match local {
            Some(addr) if !addr.ip().is_unspecified() => (Some(addr.ip()), addr.port()),
            Some(addr) => (self.default_local_ip(), addr.port()),
            None => (self.default_local_ip(), 0),
        };
        let Some(local_ip) = local_ip else {
            let _ = reply.send(Err(StackError::NoAddress));
            return;
        };
        let port = if requested_port == 0 {
            self.alloc_port()
        } else {
            requested_port
        };

        let rx_buffer = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_META_SLOTS],
            vec![0u8; UDP_BUFFER_SIZE],
        );
        let tx_buffer = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_META_SLOTS],
            vec![0u8; UDP_BUFFER_SIZE],
        );
        let mut socket = udp::Socket::new(rx_buffer, tx_buffer);
        if let Err(err) = socket.bind((to_smol(local_ip), port)) {
            let _ = reply.send(Err(StackError::Setup(err.to_string())));
            return;
        }

        let (to_stack_tx, to_stack_rx) = mpsc::channel::<(Bytes, SocketAddr)>(CHANNEL_DEPTH);
        let (from_stack_tx, from_stack_rx) = mpsc::channel::<(Bytes, SocketAddr)>(CHANNEL_DEPTH);

        let virtual_socket = VirtualUdpSocket {
            tx: to_stack_tx,
            rx: tokio::sync::Mutex::new(from_stack_rx),
            notify: Arc::clone(&self.notify),
            local_addr: SocketAddr::new(local_ip, port),
            max_payload: self.mtu.saturating_sub(UDP_HEADER_OVERHEAD),
        };

        let handle = self.sockets.add(socket);
        self.udp_entries.insert(
            handle,
            UdpEntry {
                to_stack: to_stack_rx,
                pending: None,
                from_stack: from_stack_tx,
            },
        );
        trace!(addr = %virtual_socket.local_addr(), "virtual UDP endpoint bound");
        let _ = reply.send(Ok(virtual_socket));
    }

    fn service_tcp(&mut self) {
        let mut finished = Vec::new();

        for (&handle, entry) in self.tcp_entries.iter_mut() {
            let socket = self.sockets.get_mut::<tcp::Socket>(handle);

            // Resolve pending connects
            if let Some(deadline) = entry.connect.as_ref().map(|c| c.deadline) {
                match socket.state() {
                    tcp::State::Established => {
                        if let Some(mut connect) = entry.connect.take() {
                            if let Some(stream) = connect.stream.take() {
                                let _ = connect.reply.send(Ok(stream));
                            }
                        }
                    }
                    tcp::State::Closed => {
                        if let Some(connect) = entry.connect.take() {
                            let _ = connect.reply.send(Err(StackError::Refused));
                        }
                        finished.push(handle);
                        continue;
                    }
                    _ if Instant::now() >= deadline => {
                        if let Some(connect) = entry.connect.take() {
                            let _ = connect.reply.send(Err(StackError::ConnectTimeout));
                        }
                        socket.abort();
                        finished.push(handle);
                        continue;
                    }
                    _ => continue,
                }
            }

            // Writer half to socket
            loop {
                if entry.pending.is_none() {
                    match entry.to_stack.try_recv() {
                        Ok(chunk) => entry.pending = Some(chunk),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            if !entry.fin_queued {
                                socket.close();
                                entry.fin_queued = true;
                            }
                            break;
                        }
                    }
                }
                let Some(chunk) = &mut entry.pending else { break };
                if !socket.can_send() {
                    break;
                }
                match socket.send_slice(chunk) {
                    Ok(sent) => {
                        let _ = chunk.split_to(sent);
                        if chunk.is_empty() {
                            entry.pending = None;
                        }
                    }
                    Err(_) => {
                        entry.pending = None;
                        break;
                    }
                }
            }

            // Socket to reader half
            if let Some(tx) = &entry.from_stack {
                if tx.is_closed() {
                    // Reader gone: drain and discard
                    while socket.can_recv() {
                        let _ = socket.recv(|buf| (buf.len(), ()));
                    }
                    entry.from_stack = None;
                    socket.close();
                } else {
                    while socket.can_recv() && tx.capacity() > 0 {
                        let chunk = socket
                            .recv(|buf| {
                                let n = buf.len();
                                (n, Bytes::copy_from_slice(buf))
                            })
                            .unwrap_or_else(|_| Bytes::new());
                        if chunk.is_empty() {
                            break;
                        }
                        if tx.try_send(chunk).is_err() {
                            break;
                        }
                    }
                    // Remote finished and everything is drained: signal EOF
                    if !socket.may_recv() && !socket.can_recv() && !socket.is_listening() {
                        if !matches!(socket.state(), tcp::State::SynSent | tcp::State::SynReceived)
                        {
                            entry.from_stack = None;
                        }
                    }
                }
            }

            if socket.state() == tcp::State::Closed && entry.connect.is_none() {
                finished.push(handle);
            }
        }

        for handle in finished {
            if self.tcp_entries.remove(&handle).is_some() {
                self.sockets.remove(handle);
            }
        }
    }

    fn service_udp(&mut self) {
        let mut finished = Vec::new();

        for (&handle, entry) in self.udp_entries.iter_mut() {
            let socket = self.sockets.get_mut::<udp::Socket>(handle);

            // Outbound datagrams
            loop {
                if entry.pending.is_none() {
                    match entry.to_stack.try_recv() {
                        Ok(item) => entry.pending = Some(item),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            if entry.from_stack.is_closed() {
                                finished.push(handle);
                            }
                            break;
                        }
                    }
                }
                let Some((data, target)) = entry.pending.take() else {
                    break;
                };
                let endpoint = IpEndpoint::new(to_smol(target.ip()), target.port());
                match socket.send_slice(&data, endpoint) {
                    Ok(()) => {}
                    Err(udp::SendError::BufferFull) => {
                        entry.pending = Some((data, target));
                        break;
                    }
                    Err(udp::SendError::Unaddressable) => {
                        trace!(%target, "dropping unaddressable datagram");
                    }
                }
            }

            // Inbound datagrams
            while socket.can_recv() && entry.from_stack.capacity() > 0 {
                match socket.recv() {
                    Ok((data, meta)) => {
                        let from =
                            SocketAddr::new(from_smol(meta.endpoint.addr), meta.endpoint.port);
                        let _ = entry.from_stack.try_send((Bytes::copy_from_slice(data), from));
                    }
                    Err(_) => break,
                }
            }
        }

        for handle in finished {
            if self.udp_entries.remove(&handle).is_some() {
                self.sockets.remove(handle);
            }
        }
    }

    /// Interface address matching the destination family, used to report
    /// the local side of virtual connections
    fn local_ip_for(&self, remote: IpAddr) -> Option<IpAddr> {
        self.addresses
            .iter()
            .map(|net| net.addr())
            .find(|addr| addr.is_ipv4() == remote.is_ipv4())
    }

    fn default_local_ip(&self) -> Option<IpAddr> {
        self.addresses.first().map(|net| net.addr())
    }

    fn alloc_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if self.next_port == u16::MAX {
            EPHEMERAL_PORT_START
        } else {
            self.next_port + 1
        };
        port
    }
}
