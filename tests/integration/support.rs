//! Shared helpers for the relay integration tests
//!
//! Every test drives a real [`Engine`] through an in-memory tunnel and talks
//! to loopback servers, so no privileges or network access are needed.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tun_relay::config::Config;
use tun_relay::packet::checksum::{tcp_checksum, verify_ipv4_checksum};
use tun_relay::packet::{build_tcp_packet, build_udp_packet, PacketHeaders};
use tun_relay::{ChannelTun, Engine, EngineBuilder, TunPeer};

/// Address the simulated device sends from
pub const DEVICE: Ipv4Addr = Ipv4Addr::new(10, 1, 10, 1);

/// How long a test waits for the engine to answer
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Config tuned for fast test turnaround
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.workers.idle_sleep_ms = 2;
    config.workers.poll_timeout_ms = 10;
    config
}

/// Start an engine over an in-memory tunnel
pub fn start_engine(config: Config) -> (Engine, TunPeer) {
    start_with(EngineBuilder::new(config))
}

/// Start a pre-configured builder over an in-memory tunnel
pub fn start_with(builder: EngineBuilder) -> (Engine, TunPeer) {
    let (tun, peer) = ChannelTun::pair();
    let engine = builder.start(Arc::new(tun)).expect("engine should start");
    (engine, peer)
}

/// A datagram written back to the device, already parsed
pub struct Reply {
    pub headers: PacketHeaders,
    pub payload: Vec<u8>,
    pub raw: Vec<u8>,
}

impl Reply {
    pub fn parse(raw: Vec<u8>) -> Self {
        let (headers, range) = PacketHeaders::parse(&raw).expect("engine wrote a malformed datagram");
        let payload = raw[range].to_vec();
        Self {
            headers,
            payload,
            raw,
        }
    }

    pub fn flags(&self) -> u8 {
        self.headers.tcp().expect("not a TCP reply").flags
    }

    pub fn seq(&self) -> u32 {
        self.headers.tcp().expect("not a TCP reply").sequence_number
    }

    pub fn ack(&self) -> u32 {
        self.headers.tcp().expect("not a TCP reply").acknowledgement_number
    }

    /// Assert both the IPv4 and TCP checksums are valid
    pub fn assert_tcp_checksums(&self) {
        let ip = &self.headers.ip;
        assert!(verify_ipv4_checksum(&self.raw[..ip.header_len()]));
        let segment = &self.raw[ip.header_len()..usize::from(ip.total_length)];
        let stored = u16::from_be_bytes([segment[16], segment[17]]);
        assert_eq!(tcp_checksum(segment, ip.source, ip.destination), stored);
    }
}

/// Next datagram the engine writes to the device
pub fn recv_reply(peer: &TunPeer) -> Reply {
    let raw = peer
        .recv_timeout(REPLY_TIMEOUT)
        .expect("no datagram written to the device");
    Reply::parse(raw)
}

/// Next datagram the engine writes to device port `port`; datagrams for
/// other flows are skipped
pub fn recv_reply_for(peer: &TunPeer, port: u16) -> Reply {
    let deadline = Instant::now() + REPLY_TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let raw = peer
            .recv_timeout(left)
            .unwrap_or_else(|| panic!("no datagram written to device port {port}"));
        let reply = Reply::parse(raw);
        if reply.headers.transport.ports().map(|(_, dst)| dst) == Some(port) {
            return reply;
        }
    }
}

/// Assert nothing reaches the device for `window`
pub fn assert_silent(peer: &TunPeer, window: Duration) {
    if let Some(raw) = peer.recv_timeout(window) {
        let reply = Reply::parse(raw);
        panic!("unexpected datagram to device: {:?}", reply.headers);
    }
}

pub fn send_tcp(peer: &TunPeer, src_port: u16, dst: SocketAddrV4, seq: u32, ack: u32, flags: u8, payload: &[u8]) {
    let packet = build_tcp_packet(SocketAddrV4::new(DEVICE, src_port), dst, seq, ack, flags, payload)
        .expect("segment should build");
    assert!(peer.send(packet));
}

pub fn send_udp(peer: &TunPeer, src_port: u16, dst: SocketAddrV4, payload: &[u8]) {
    let packet = build_udp_packet(SocketAddrV4::new(DEVICE, src_port), dst, payload)
        .expect("datagram should build");
    assert!(peer.send(packet));
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn tcp_listener() -> (TcpListener, SocketAddrV4) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind TCP listener");
    let addr = match listener.local_addr().expect("listener address") {
        std::net::SocketAddr::V4(addr) => addr,
        std::net::SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
    };
    (listener, addr)
}

/// A listener whose accepted connections advertise a tiny receive window,
/// so a peer that never reads fills the sender's buffers quickly
pub fn small_window_listener() -> (TcpListener, SocketAddrV4) {
    use socket2::{Domain, Protocol, SockAddr, Socket, Type};

    let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).expect("listener socket");
    listener.set_recv_buffer_size(4096).expect("shrink receive buffer");
    let any: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    listener.bind(&SockAddr::from(any)).expect("bind listener");
    listener.listen(16).expect("listen");
    let listener: TcpListener = listener.into();
    let addr = match listener.local_addr().expect("listener address") {
        std::net::SocketAddr::V4(addr) => addr,
        std::net::SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
    };
    (listener, addr)
}

/// A listener whose accept queue is already full.
///
/// New SYNs to it are dropped, so a connect stays in progress until the
/// queued connection is accepted and the client retransmits. The returned
/// socket owns the queued connection.
pub fn saturated_listener() -> (TcpListener, SocketAddrV4, socket2::Socket) {
    use socket2::{Domain, Protocol, SockAddr, Socket, Type};

    let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).expect("listener socket");
    let any: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    listener.bind(&SockAddr::from(any)).expect("bind listener");
    listener.listen(0).expect("listen");
    let listener: TcpListener = listener.into();
    let addr = match listener.local_addr().expect("listener address") {
        std::net::SocketAddr::V4(addr) => addr,
        std::net::SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
    };

    let filler = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).expect("filler socket");
    filler.set_nonblocking(true).expect("non-blocking filler");
    let _ = filler.connect(&SockAddr::from(std::net::SocketAddr::V4(addr)));
    thread::sleep(Duration::from_millis(50));
    (listener, addr, filler)
}

/// UDP server echoing every datagram upper-cased
pub fn udp_echo_server() -> SocketAddrV4 {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind UDP socket");
    let addr = match socket.local_addr().expect("socket address") {
        std::net::SocketAddr::V4(addr) => addr,
        std::net::SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
    };
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf) {
            let reply = buf[..n].to_ascii_uppercase();
            if socket.send_to(&reply, from).is_err() {
                break;
            }
        }
    });
    addr
}

/// A loopback port with nothing listening on it
pub fn closed_port() -> SocketAddrV4 {
    let (listener, addr) = tcp_listener();
    drop(listener);
    addr
}
