//! Engine lifecycle integration tests
//!
//! Shutdown must stop every worker, close every relay socket, release the
//! buffer pool and close the device, whether it is requested or forced by a
//! device failure.

use std::io::Read;
use std::time::Duration;

use tun_relay::packet::tcp_flags::{ACK, SYN};
use tun_relay::EngineStatus;

use super::support::{
    recv_reply, send_tcp, send_udp, start_engine, tcp_listener, test_config, udp_echo_server,
    wait_until, DEVICE, REPLY_TIMEOUT,
};

#[test]
fn test_shutdown_closes_live_sessions() {
    let (listener, tcp_server) = tcp_listener();
    let udp_server = udp_echo_server();
    let (engine, peer) = start_engine(test_config());

    send_tcp(&peer, 41000, tcp_server, 1, 0, SYN, b"");
    let syn_ack = recv_reply(&peer);
    send_tcp(&peer, 41000, tcp_server, 2, syn_ack.seq().wrapping_add(1), ACK, b"");
    let (mut remote, _) = listener.accept().unwrap();
    remote.set_read_timeout(Some(REPLY_TIMEOUT)).unwrap();

    send_udp(&peer, 41001, udp_server, b"x");
    recv_reply(&peer);

    assert!(wait_until(REPLY_TIMEOUT, || engine.tcp_sessions() == 1));
    assert_eq!(engine.udp_sessions(), 1);

    engine.shutdown();

    assert_eq!(engine.status(), EngineStatus::Stopped);
    assert_eq!(engine.failure(), None);
    assert_eq!(engine.tcp_sessions(), 0);
    assert_eq!(engine.udp_sessions(), 0);
    assert_eq!(engine.pool().available(), 0);
    assert!(engine.pool().is_closed());

    // The remote side sees the relay socket close
    let mut buf = [0u8; 4];
    assert!(matches!(remote.read(&mut buf), Ok(0) | Err(_)));

    // The device was closed once everything queued was delivered
    while peer.try_recv().is_some() {}
    assert!(peer.is_disconnected());
}

#[test]
fn test_shutdown_is_idempotent() {
    let (engine, _peer) = start_engine(test_config());
    engine.shutdown();
    engine.shutdown();
    assert_eq!(engine.status(), EngineStatus::Stopped);
    assert_eq!(
        engine.wait_stopped(Duration::from_millis(10)),
        Some(EngineStatus::Stopped)
    );
}

#[test]
fn test_injection_after_shutdown_is_rejected() {
    let (engine, peer) = start_engine(test_config());
    engine.shutdown();

    let packet = tun_relay::packet::build_udp_packet(
        std::net::SocketAddrV4::new(DEVICE, 41010),
        "127.0.0.1:9".parse().unwrap(),
        b"late",
    )
    .unwrap();
    // The tunnel's inbound side may still accept the datagram, but nothing
    // processes it any more
    let _ = peer.send(packet);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(engine.stats().packets_from_device, 0);
}

#[test]
fn test_device_hangup_fails_engine_and_cleans_up() {
    let udp_server = udp_echo_server();
    let (engine, peer) = start_engine(test_config());

    send_udp(&peer, 41020, udp_server, b"x");
    recv_reply(&peer);
    assert_eq!(engine.udp_sessions(), 1);

    drop(peer);
    assert_eq!(
        engine.wait_stopped(Duration::from_secs(5)),
        Some(EngineStatus::Failed)
    );
    assert!(engine.failure().is_some());
    assert_eq!(engine.udp_sessions(), 0);
    assert_eq!(engine.pool().available(), 0);
}

#[test]
fn test_drop_stops_engine() {
    let (engine, peer) = start_engine(test_config());
    drop(engine);
    while peer.try_recv().is_some() {}
    assert!(peer.is_disconnected());
}
