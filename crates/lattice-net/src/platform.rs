//! Socket construction and per-socket options.
//!
//! [`SocketConfig`] gathers the options every endpoint applies: TCP_NODELAY
//! and keepalive on streams, SO_REUSEADDR and dual-stack IPv6 on listeners,
//! and optional kernel buffer sizes on the reliable-UDP socket.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::debug;

/// Socket options applied by listeners, connectors and UDP endpoints.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm for lower latency. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
    /// Number of keepalive probes before declaring connection dead. Default: 3.
    pub keepalive_retries: u32,
    /// Enable `SO_REUSEADDR` on server sockets. Default: true on Linux/macOS, false on Windows.
    pub reuse_addr: bool,
    /// Pending-connection backlog of the listener. Default: 128.
    pub backlog: i32,
    /// `SO_RCVBUF` for UDP sockets, `None` keeps the OS default.
    pub udp_recv_buffer: Option<usize>,
    /// `SO_SNDBUF` for UDP sockets, `None` keeps the OS default.
    pub udp_send_buffer: Option<usize>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
            backlog: 128,
            udp_recv_buffer: None,
            udp_send_buffer: None,
        }
    }
}

/// Apply socket configuration to a connected [`TcpStream`].
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let sock_ref = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);

        // Retries are supported on Linux and Windows but not macOS.
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(config.keepalive_retries);

        sock_ref.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

fn new_socket(addr: SocketAddr, ty: Type, protocol: Protocol) -> std::io::Result<Socket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, ty, Some(protocol))?;

    // Dual-stack: an IPv6 wildcard also serves IPv4 peers.
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Create the server [`TcpListener`] with `SO_REUSEADDR`, dual stack and the
/// configured backlog.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let socket = new_socket(addr, Type::STREAM, Protocol::TCP)?;
    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }

    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Bind a [`UdpSocket`], enlarging kernel buffers if configured.
///
/// Must be called within a tokio runtime.
pub fn create_udp_socket(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<UdpSocket> {
    let socket = new_socket(addr, Type::DGRAM, Protocol::UDP)?;

    if let Some(size) = config.udp_recv_buffer {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.udp_send_buffer {
        socket.set_send_buffer_size(size)?;
    }

    socket.bind(&addr.into())?;
    debug!(
        %addr,
        recv_buffer = socket.recv_buffer_size()?,
        send_buffer = socket.send_buffer_size()?,
        "UDP socket bound"
    );

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}
