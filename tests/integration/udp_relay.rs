//! UDP translator integration tests

use std::net::UdpSocket;
use std::time::Duration;

use tun_relay::packet::TransportProtocol;

use super::support::{
    recv_reply, send_udp, start_engine, test_config, udp_echo_server, wait_until, DEVICE,
    REPLY_TIMEOUT,
};

#[test]
fn test_datagram_round_trip() {
    let server = udp_echo_server();
    let (engine, peer) = start_engine(test_config());

    send_udp(&peer, 53000, server, b"ping");
    let reply = recv_reply(&peer);

    assert_eq!(reply.headers.ip.protocol, TransportProtocol::Udp);
    assert_eq!(reply.headers.ip.source, *server.ip());
    assert_eq!(reply.headers.ip.destination, DEVICE);
    let udp = reply.headers.udp().unwrap();
    assert_eq!(udp.source_port, server.port());
    assert_eq!(udp.destination_port, 53000);
    assert_eq!(udp.length, 8 + 4);
    assert_eq!(udp.checksum, 0);
    assert_eq!(reply.payload, b"PING");
    assert!(tun_relay::packet::verify_ipv4_checksum(&reply.raw[..20]));

    assert_eq!(engine.udp_sessions(), 1);
}

#[test]
fn test_session_is_reused_per_flow() {
    let server = udp_echo_server();
    let (engine, peer) = start_engine(test_config());

    for payload in [&b"one"[..], b"two", b"three"] {
        send_udp(&peer, 53001, server, payload);
        assert_eq!(recv_reply(&peer).payload, payload.to_ascii_uppercase());
    }

    let stats = engine.stats();
    assert_eq!(stats.udp_sessions_opened, 1);
    assert_eq!(engine.udp_sessions(), 1);
}

#[test]
fn test_distinct_source_ports_get_distinct_sessions() {
    let server = udp_echo_server();
    let (engine, peer) = start_engine(test_config());

    send_udp(&peer, 53002, server, b"a");
    let first = recv_reply(&peer);
    send_udp(&peer, 53003, server, b"b");
    let second = recv_reply(&peer);

    assert_eq!(first.headers.udp().unwrap().destination_port, 53002);
    assert_eq!(second.headers.udp().unwrap().destination_port, 53003);
    assert_eq!(engine.udp_sessions(), 2);
}

#[test]
fn test_eviction_closes_oldest_session() {
    let server = udp_echo_server();
    let mut config = test_config();
    config.sessions.udp_capacity = 2;
    let (engine, peer) = start_engine(config);

    for port in 53010..53013 {
        send_udp(&peer, port, server, b"x");
        recv_reply(&peer);
    }

    assert_eq!(engine.udp_sessions(), 2);
    let stats = engine.stats();
    assert_eq!(stats.udp_sessions_opened, 3);
    assert_eq!(stats.evictions, 1);

    // The evicted flow opens a fresh session on its next datagram
    send_udp(&peer, 53010, server, b"back");
    assert_eq!(recv_reply(&peer).payload, b"BACK");
    assert_eq!(engine.stats().udp_sessions_opened, 4);
    assert_eq!(engine.udp_sessions(), 2);
}

#[test]
fn test_unsolicited_remote_datagrams_are_relayed() {
    // The relay socket is connected, so anything the remote sends on the
    // flow is delivered, not only direct replies
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    server.set_read_timeout(Some(REPLY_TIMEOUT)).unwrap();
    let addr = match server.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        std::net::SocketAddr::V6(_) => unreachable!(),
    };
    let (_engine, peer) = start_engine(test_config());

    send_udp(&peer, 53020, addr, b"hello");
    let mut buf = [0u8; 64];
    let (n, relay) = server.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");

    for chunk in [&b"first"[..], b"second"] {
        server.send_to(chunk, relay).unwrap();
    }
    assert_eq!(recv_reply(&peer).payload, b"first");
    assert_eq!(recv_reply(&peer).payload, b"second");
}

#[test]
fn test_stats_track_device_traffic() {
    let server = udp_echo_server();
    let (engine, peer) = start_engine(test_config());

    send_udp(&peer, 53030, server, b"abc");
    recv_reply(&peer);

    assert!(wait_until(Duration::from_secs(1), || {
        let stats = engine.stats();
        stats.packets_to_device == 1 && stats.packets_from_device == 1
    }));
    let stats = engine.stats();
    assert_eq!(stats.bytes_from_device, 28 + 3);
    assert_eq!(stats.bytes_to_device, 28 + 3);
}
