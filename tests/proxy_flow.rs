//! End-to-end proxy flows over loopback
//!
//! Runs the real front door and protocol servers with a dialer that goes
//! out over the host loopback instead of a tunnel, so every byte of the
//! SOCKS and HTTP wire protocols is exercised against live sockets.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use wgbridge::forward::{DialedConn, Forwarder, TunnelDialer};
use wgbridge::proxy::socks5::{Credentials, Socks5Server, UdpMode};
use wgbridge::proxy::{FrontDoor, Network, ProxyError};

/// Dials destinations over the host network instead of a tunnel
struct LoopbackDialer;

#[async_trait]
impl TunnelDialer for LoopbackDialer {
    async fn dial(
        &self,
        network: Network,
        host: &str,
        port: u16,
    ) -> Result<DialedConn, ProxyError> {
        if network.is_udp() {
            let socket = UdpSocket::bind("127.0.0.1:0")
                .await
                .map_err(ProxyError::from_dial)?;
            socket
                .connect((host, port))
                .await
                .map_err(ProxyError::from_dial)?;
            let local_addr = socket.local_addr().map_err(ProxyError::Io)?;
            Ok(DialedConn {
                stream: Box::new(UdpStream { socket }),
                local_addr,
            })
        } else {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(ProxyError::from_dial)?;
            let local_addr = stream.local_addr().map_err(ProxyError::Io)?;
            Ok(DialedConn {
                stream: Box::new(stream),
                local_addr,
            })
        }
    }
}

/// Connected-UDP as a byte stream, one datagram per read/write
struct UdpStream {
    socket: UdpSocket,
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.socket.poll_send(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A TCP echo server that prefixes every connection with a banner
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

struct TestProxy {
    socks_addr: SocketAddr,
    http_addr: SocketAddr,
    token: CancellationToken,
}

async fn spawn_proxy(credentials: Option<Credentials>) -> TestProxy {
    let token = CancellationToken::new();
    let forwarder = Arc::new(Forwarder::new(Arc::new(LoopbackDialer), token.clone()));
    let front = FrontDoor::bind(
        forwarder,
        Some("127.0.0.1:0".parse().unwrap()),
        Some("127.0.0.1:0".parse().unwrap()),
        credentials,
        token.clone(),
    )
    .await
    .unwrap();

    let proxy = TestProxy {
        socks_addr: front.socks_addr().unwrap(),
        http_addr: front.http_addr().unwrap(),
        token,
    };
    tokio::spawn(front.run());
    proxy
}

#[tokio::test]
async fn socks5_connect_to_literal_ipv4() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_proxy(None).await;

    let mut client = TcpStream::connect(proxy.socks_addr).await.unwrap();

    // Greeting: version 5, one method, no-auth
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    // CONNECT to the echo server by literal IPv4
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut head = [0u8; 4];
    client.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0x05);
    assert_eq!(head[1], 0x00);
    // Skip the bound address: ATYP already read in head[3]
    let skip = match head[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        other => panic!("unexpected ATYP {}", other),
    };
    let mut bound = vec![0u8; skip];
    client.read_exact(&mut bound).await.unwrap();

    // Tunnel is up: echo round-trip
    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut echoed = [0u8; 18];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"GET / HTTP/1.0\r\n\r\n");

    proxy.token.cancel();
}

#[tokio::test]
async fn socks5_dial_failure_maps_to_refused() {
    let proxy = spawn_proxy(None).await;
    // Bind-then-drop to find a port with nothing listening
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut client = TcpStream::connect(proxy.socks_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&dead_port.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut head = [0u8; 4];
    client.read_exact(&mut head).await.unwrap();
    assert_eq!(head[1], 0x05, "connection refused reply expected");

    proxy.token.cancel();
}

#[tokio::test]
async fn socks5_credentials_negotiation() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_proxy(Some(Credentials {
        username: "alice".into(),
        password: "secret".into(),
    }))
    .await;

    let mut client = TcpStream::connect(proxy.socks_addr).await.unwrap();

    // Offer no-auth and username/password; server must pick the latter
    client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x02]);

    // RFC 1929 subnegotiation
    let mut auth = vec![0x01, 5];
    auth.extend_from_slice(b"alice");
    auth.push(6);
    auth.extend_from_slice(b"secret");
    client.write_all(&auth).await.unwrap();
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x01, 0x00]);

    // And a normal CONNECT works afterwards
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut head = [0u8; 4];
    client.read_exact(&mut head).await.unwrap();
    assert_eq!(head[1], 0x00);

    proxy.token.cancel();
}

#[tokio::test]
async fn socks5_rejects_auth_without_acceptable_method() {
    let proxy = spawn_proxy(Some(Credentials {
        username: "alice".into(),
        password: "secret".into(),
    }))
    .await;

    let mut client = TcpStream::connect(proxy.socks_addr).await.unwrap();
    // Offer only no-auth while credentials are required: still selected,
    // since no-auth remains acceptable by the negotiation order
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    // Offering nothing acceptable gets 0xFF and a close
    let mut client = TcpStream::connect(proxy.socks_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x03]).await.unwrap();
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xFF]);

    proxy.token.cancel();
}

#[tokio::test]
async fn socks4a_connect_by_hostname() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_proxy(None).await;

    let mut client = TcpStream::connect(proxy.socks_addr).await.unwrap();

    // SOCKS4a: 0.0.0.1 destination, empty userid, hostname "localhost"
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&echo.port().to_be_bytes());
    request.extend_from_slice(&[0, 0, 0, 1]);
    request.push(0);
    request.extend_from_slice(b"localhost\0");
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x00);
    assert_eq!(reply[1], 0x5A);

    client.write_all(b"ping4a").await.unwrap();
    let mut echoed = [0u8; 6];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping4a");

    proxy.token.cancel();
}

#[tokio::test]
async fn front_door_rejects_unknown_first_byte() {
    let proxy = spawn_proxy(None).await;

    let mut client = TcpStream::connect(proxy.socks_addr).await.unwrap();
    client.write_all(&[0x07, 0x00, 0x00]).await.unwrap();

    // Server closes without writing anything
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);

    proxy.token.cancel();
}

#[tokio::test]
async fn http_connect_bridges_raw_stream() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_proxy(None).await;

    let mut client = TcpStream::connect(proxy.http_addr).await.unwrap();
    let request = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = echo.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        response.push(byte[0]);
    }
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 Connection Established"));

    client.write_all(b"raw bytes").await.unwrap();
    let mut echoed = [0u8; 9];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"raw bytes");

    proxy.token.cancel();
}

#[tokio::test]
async fn http_absolute_form_replays_request_upstream() {
    // Upstream captures the request and answers a fixed response
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    let upstream = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut seen = Vec::new();
        loop {
            let n = conn.read(&mut buf).await.unwrap();
            seen.extend_from_slice(&buf[..n]);
            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        conn.write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        String::from_utf8(seen).unwrap()
    });

    let proxy = spawn_proxy(None).await;
    let mut client = TcpStream::connect(proxy.http_addr).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/hello?x=1 HTTP/1.1\r\nHost: 127.0.0.1\r\nAccept: */*\r\n\r\n",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = vec![0u8; 256];
    let n = client.read(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response[..n]);
    assert!(text.starts_with("HTTP/1.1 204"));

    let seen = upstream.await.unwrap();
    assert!(seen.starts_with("GET /hello?x=1 HTTP/1.1\r\n"), "upstream saw: {}", seen);
    assert!(seen.contains("Accept: */*"));

    proxy.token.cancel();
}

#[tokio::test]
async fn http_dial_failure_answers_503() {
    let proxy = spawn_proxy(None).await;
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut client = TcpStream::connect(proxy.http_addr).await.unwrap();
    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", dead_port);
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = vec![0u8; 256];
    let n = client.read(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response[..n]).starts_with("HTTP/1.1 503"));

    proxy.token.cancel();
}

#[tokio::test]
async fn socks5_embedded_relay_without_tunnel_forwarding() {
    // UDP echo target on the host network
    let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((n, from)) = target.recv_from(&mut buf).await else {
                break;
            };
            let _ = target.send_to(&buf[..n], from).await;
        }
    });

    // Serve one connection directly through a relay-mode server
    let token = CancellationToken::new();
    let forwarder = Arc::new(Forwarder::new(Arc::new(LoopbackDialer), token.clone()));
    let server = Arc::new(Socks5Server::new(forwarder).with_udp_mode(UdpMode::EmbeddedRelay));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (conn, peer) = listener.accept().await.unwrap();
        let local = conn.local_addr().unwrap();
        let _ = server.serve_conn(Box::new(conn), local, peer).await;
    });

    let mut control = TcpStream::connect(server_addr).await.unwrap();
    control.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    control.read_exact(&mut reply).await.unwrap();

    control
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut head = [0u8; 4];
    control.read_exact(&mut head).await.unwrap();
    assert_eq!(head[1], 0x00);
    let mut bound = [0u8; 6];
    control.read_exact(&mut bound).await.unwrap();
    let relay_port = u16::from_be_bytes([bound[4], bound[5]]);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut datagram = vec![0x00, 0x00, 0x00, 0x01, 127, 0, 0, 1];
    datagram.extend_from_slice(&target_addr.port().to_be_bytes());
    datagram.extend_from_slice(b"relayed");
    client
        .send_to(&datagram, format!("127.0.0.1:{}", relay_port))
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("relay reply timed out")
        .unwrap();
    // Reply prefix is RSV,FRAG zeroes plus the cached target address
    assert_eq!(&buf[..4], &[0, 0, 0, 0x01]);
    assert_eq!(&buf[10..n], b"relayed");

    token.cancel();
}

#[tokio::test]
async fn socks5_udp_associate_relays_datagrams() {
    // UDP echo target
    let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((n, from)) = target.recv_from(&mut buf).await else {
                break;
            };
            let _ = target.send_to(&buf[..n], from).await;
        }
    });

    let proxy = spawn_proxy(None).await;
    let mut control = TcpStream::connect(proxy.socks_addr).await.unwrap();

    control.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    control.read_exact(&mut reply).await.unwrap();

    // UDP ASSOCIATE with wildcard client address
    control
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut head = [0u8; 4];
    control.read_exact(&mut head).await.unwrap();
    assert_eq!(head[1], 0x00);
    assert_eq!(head[3], 0x01);
    let mut bound = [0u8; 6];
    control.read_exact(&mut bound).await.unwrap();
    let relay_port = u16::from_be_bytes([bound[4], bound[5]]);
    let relay_addr: SocketAddr = format!("127.0.0.1:{}", relay_port).parse().unwrap();

    // Send a framed datagram to the advertised relay
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut datagram = vec![0x00, 0x00, 0x00, 0x01, 127, 0, 0, 1];
    datagram.extend_from_slice(&target_addr.port().to_be_bytes());
    datagram.extend_from_slice(b"dns-query-bytes");
    client.send_to(&datagram, relay_addr).await.unwrap();

    // Reply must come back framed with the same target address
    let mut buf = [0u8; 2048];
    let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("relay reply timed out")
        .unwrap();
    assert_eq!(&buf[..3], &[0, 0, 0]);
    assert_eq!(buf[3], 0x01);
    assert_eq!(&buf[4..8], &[127, 0, 0, 1]);
    assert_eq!(
        u16::from_be_bytes([buf[8], buf[9]]),
        target_addr.port()
    );
    assert_eq!(&buf[10..n], b"dns-query-bytes");

    // Closing the control connection tears the association down
    drop(control);

    proxy.token.cancel();
}
