//! TCP translator integration tests
//!
//! Drives full connection lifecycles from the device side of an in-memory
//! tunnel against loopback servers.
//!
//! # Test Categories
//!
//! 1. **Handshake**: SYN, SYN-ACK and the completing ACK
//! 2. **Data**: payload in both directions with correct sequence numbers
//! 3. **Close**: device-initiated and remote-initiated shutdown
//! 4. **Resets**: refused connects, unknown flows, device RST, duplicate SYN
//! 5. **Eviction**: the least recently used flow is closed at capacity
//! 6. **Backpressure**: a remote that stops reading stalls only its own flow

use std::io::{Read, Write};
use std::net::{SocketAddrV4, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tun_relay::packet::tcp_flags::{ACK, FIN, PSH, RST, SYN};
use tun_relay::EngineStatus;

use tun_relay::config::Config;
use tun_relay::TunPeer;

use super::support::{
    assert_silent, closed_port, recv_reply, recv_reply_for, saturated_listener, send_tcp,
    small_window_listener, start_engine, tcp_listener, test_config, wait_until, Reply, DEVICE,
    REPLY_TIMEOUT,
};

const DEVICE_ISN: u32 = 1000;

/// Payload carried by each device segment in the backpressure tests
const SEGMENT: usize = 1400;

// ============================================================================
// Test Helpers
// ============================================================================

/// Complete the three-way handshake for `src_port` → `server`.
///
/// Returns the relay's initial sequence number.
fn handshake(peer: &tun_relay::TunPeer, src_port: u16, server: SocketAddrV4) -> u32 {
    send_tcp(peer, src_port, server, DEVICE_ISN, 0, SYN, b"");
    let syn_ack = recv_reply(peer);
    assert_eq!(syn_ack.flags(), SYN | ACK);
    assert_eq!(syn_ack.ack(), DEVICE_ISN + 1);
    syn_ack.assert_tcp_checksums();

    let relay_isn = syn_ack.seq();
    send_tcp(peer, src_port, server, DEVICE_ISN + 1, relay_isn.wrapping_add(1), ACK, b"");
    relay_isn
}

fn accept(listener: &std::net::TcpListener) -> TcpStream {
    let (stream, _) = listener.accept().expect("relay should connect");
    stream
        .set_read_timeout(Some(REPLY_TIMEOUT))
        .expect("set read timeout");
    stream
}

/// Send `data[from..]` as consecutive device segments, at most `limit` of them
fn push_segments(
    peer: &TunPeer,
    src_port: u16,
    server: SocketAddrV4,
    relay_next: u32,
    data: &[u8],
    from: usize,
    limit: usize,
) {
    for (i, chunk) in data[from..].chunks(SEGMENT).take(limit).enumerate() {
        let seq = (DEVICE_ISN + 1).wrapping_add((from + i * SEGMENT) as u32);
        send_tcp(peer, src_port, server, seq, relay_next, PSH | ACK, chunk);
    }
}

/// Drain replies until `window` passes without one and return the highest
/// payload offset acknowledged on `port`
fn acked_offset(peer: &TunPeer, port: u16, window: Duration, mut acked: usize) -> usize {
    while let Some(raw) = peer.recv_timeout(window) {
        let reply = Reply::parse(raw);
        let Some(tcp) = reply.headers.tcp() else {
            continue;
        };
        if tcp.destination_port != port {
            continue;
        }
        assert_eq!(tcp.flags & RST, 0, "flow {port} was reset");
        let offset = tcp.acknowledgement_number.wrapping_sub(DEVICE_ISN + 1) as usize;
        acked = acked.max(offset);
    }
    acked
}

/// Config for flows that push megabytes through small pool buffers
fn backpressure_config() -> Config {
    let mut config = test_config();
    config.pool.buffer_size = 2048;
    config.sessions.write_backlog = 64 * 1024;
    config
}

fn stream_data(len: usize) -> Vec<u8> {
    (0..=250u8).cycle().take(len).collect()
}

fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).expect("read relayed payload");
    buf
}

// ============================================================================
// Handshake Tests
// ============================================================================

#[test]
fn test_handshake_reply_addressing() {
    let (listener, server) = tcp_listener();
    let (engine, peer) = start_engine(test_config());

    send_tcp(&peer, 40000, server, DEVICE_ISN, 0, SYN, b"");
    let syn_ack = recv_reply(&peer);
    let _remote = accept(&listener);

    // The reply looks like it came straight from the server
    assert_eq!(syn_ack.headers.ip.source, *server.ip());
    assert_eq!(syn_ack.headers.ip.destination, DEVICE);
    let tcp = syn_ack.headers.tcp().unwrap();
    assert_eq!(tcp.source_port, server.port());
    assert_eq!(tcp.destination_port, 40000);
    assert_eq!(syn_ack.flags(), SYN | ACK);
    assert_eq!(syn_ack.ack(), DEVICE_ISN + 1);
    assert!(syn_ack.payload.is_empty());
    syn_ack.assert_tcp_checksums();

    assert!(wait_until(REPLY_TIMEOUT, || engine.tcp_sessions() == 1));
    assert_eq!(engine.stats().tcp_sessions_opened, 1);
}

#[test]
fn test_completing_ack_gets_no_reply() {
    let (listener, server) = tcp_listener();
    let (engine, peer) = start_engine(test_config());

    handshake(&peer, 40001, server);
    let _remote = accept(&listener);

    assert_silent(&peer, Duration::from_millis(200));
    assert_eq!(engine.tcp_sessions(), 1);
    assert_eq!(engine.stats().resets_sent, 0);
}

// ============================================================================
// Data Tests
// ============================================================================

#[test]
fn test_payload_in_both_directions() {
    let (listener, server) = tcp_listener();
    let (_engine, peer) = start_engine(test_config());

    let relay_isn = handshake(&peer, 40010, server);
    let mut remote = accept(&listener);

    // Device → remote
    send_tcp(&peer, 40010, server, DEVICE_ISN + 1, relay_isn.wrapping_add(1), PSH | ACK, b"hello");
    let ack = recv_reply(&peer);
    assert_eq!(ack.flags(), ACK);
    assert_eq!(ack.ack(), DEVICE_ISN + 6);
    assert_eq!(ack.seq(), relay_isn.wrapping_add(1));
    assert!(ack.payload.is_empty());
    assert_eq!(read_exact(&mut remote, 5), b"hello");

    // Remote → device
    remote.write_all(b"world").unwrap();
    let data = recv_reply(&peer);
    assert_eq!(data.flags(), PSH | ACK);
    assert_eq!(data.seq(), relay_isn.wrapping_add(1));
    assert_eq!(data.ack(), DEVICE_ISN + 6);
    assert_eq!(data.payload, b"world");
    data.assert_tcp_checksums();

    // Second remote chunk continues the sequence space
    remote.write_all(b"again").unwrap();
    let next = recv_reply(&peer);
    assert_eq!(next.seq(), relay_isn.wrapping_add(6));
    assert_eq!(next.payload, b"again");
}

#[test]
fn test_large_remote_payload_is_segmented() {
    let (listener, server) = tcp_listener();
    let (_engine, peer) = start_engine(test_config());

    let relay_isn = handshake(&peer, 40011, server);
    let mut remote = accept(&listener);

    let sent: Vec<u8> = (0..=255u8).cycle().take(8000).collect();
    remote.write_all(&sent).unwrap();

    let mut received = Vec::new();
    let mut expected_seq = relay_isn.wrapping_add(1);
    while received.len() < sent.len() {
        let segment = recv_reply(&peer);
        assert_eq!(segment.flags(), PSH | ACK);
        assert_eq!(segment.seq(), expected_seq);
        // Every segment fits the interface MTU
        assert!(segment.raw.len() <= 1500);
        expected_seq = expected_seq.wrapping_add(segment.payload.len() as u32);
        received.extend_from_slice(&segment.payload);
    }
    assert_eq!(received, sent);
}

// ============================================================================
// Close Tests
// ============================================================================

#[test]
fn test_device_initiated_close() {
    let (listener, server) = tcp_listener();
    let (engine, peer) = start_engine(test_config());

    let relay_isn = handshake(&peer, 40020, server);
    let mut remote = accept(&listener);

    send_tcp(&peer, 40020, server, DEVICE_ISN + 1, relay_isn.wrapping_add(1), FIN | ACK, b"");
    let ack = recv_reply(&peer);
    assert_eq!(ack.flags(), ACK);
    assert_eq!(ack.ack(), DEVICE_ISN + 2);

    // The remote sees the half-close, then closes its own side
    let mut rest = Vec::new();
    assert_eq!(remote.read_to_end(&mut rest).unwrap(), 0);
    drop(remote);

    let fin = recv_reply(&peer);
    assert_eq!(fin.flags(), FIN | ACK);
    assert_eq!(fin.seq(), relay_isn.wrapping_add(1));
    assert_eq!(fin.ack(), DEVICE_ISN + 2);

    send_tcp(&peer, 40020, server, DEVICE_ISN + 2, relay_isn.wrapping_add(2), ACK, b"");
    assert!(wait_until(REPLY_TIMEOUT, || engine.tcp_sessions() == 0));
}

#[test]
fn test_device_close_with_payload_delivers_payload() {
    let (listener, server) = tcp_listener();
    let (_engine, peer) = start_engine(test_config());

    let relay_isn = handshake(&peer, 40021, server);
    let mut remote = accept(&listener);

    send_tcp(&peer, 40021, server, DEVICE_ISN + 1, relay_isn.wrapping_add(1), FIN | PSH | ACK, b"bye");
    let ack = recv_reply(&peer);
    assert_eq!(ack.ack(), DEVICE_ISN + 1 + 3 + 1);

    let mut rest = Vec::new();
    remote.read_to_end(&mut rest).unwrap();
    assert_eq!(rest, b"bye");
}

#[test]
fn test_remote_initiated_close() {
    let (listener, server) = tcp_listener();
    let (engine, peer) = start_engine(test_config());

    let relay_isn = handshake(&peer, 40022, server);
    let mut remote = accept(&listener);
    remote.write_all(b"bye").unwrap();
    drop(remote);

    let data = recv_reply(&peer);
    assert_eq!(data.payload, b"bye");
    let fin = recv_reply(&peer);
    assert_eq!(fin.flags(), FIN | ACK);
    assert_eq!(fin.seq(), relay_isn.wrapping_add(4));

    // Device acknowledges, then sends its own FIN
    let relay_next = relay_isn.wrapping_add(5);
    send_tcp(&peer, 40022, server, DEVICE_ISN + 1, relay_next, ACK, b"");
    send_tcp(&peer, 40022, server, DEVICE_ISN + 1, relay_next, FIN | ACK, b"");

    let last = recv_reply(&peer);
    assert_eq!(last.flags(), ACK);
    assert_eq!(last.ack(), DEVICE_ISN + 2);
    assert!(wait_until(REPLY_TIMEOUT, || engine.tcp_sessions() == 0));
}

// ============================================================================
// Reset Tests
// ============================================================================

#[test]
fn test_refused_connect_resets_device() {
    let server = closed_port();
    let (engine, peer) = start_engine(test_config());

    send_tcp(&peer, 40030, server, DEVICE_ISN, 0, SYN, b"");
    let rst = recv_reply(&peer);
    assert_ne!(rst.flags() & RST, 0);
    assert_eq!(rst.ack(), DEVICE_ISN + 1);
    rst.assert_tcp_checksums();

    assert!(wait_until(REPLY_TIMEOUT, || engine.tcp_sessions() == 0));
    let stats = engine.stats();
    assert_eq!(stats.connect_failures, 1);
    assert_eq!(stats.resets_sent, 1);
}

#[test]
fn test_unknown_flow_is_reset() {
    let (_listener, server) = tcp_listener();
    let (engine, peer) = start_engine(test_config());

    send_tcp(&peer, 40031, server, 5000, 7777, PSH | ACK, b"stale");
    let rst = recv_reply(&peer);
    assert_eq!(rst.flags(), RST | ACK);
    assert_eq!(rst.seq(), 7777);
    assert_eq!(rst.ack(), 5005);
    assert_eq!(engine.tcp_sessions(), 0);
}

#[test]
fn test_unknown_reset_is_ignored() {
    let (_listener, server) = tcp_listener();
    let (engine, peer) = start_engine(test_config());

    send_tcp(&peer, 40032, server, 5000, 0, RST, b"");
    assert_silent(&peer, Duration::from_millis(200));
    assert_eq!(engine.stats().resets_sent, 0);
}

#[test]
fn test_device_reset_destroys_session() {
    let (listener, server) = tcp_listener();
    let (engine, peer) = start_engine(test_config());

    let relay_isn = handshake(&peer, 40033, server);
    let mut remote = accept(&listener);
    assert!(wait_until(REPLY_TIMEOUT, || engine.tcp_sessions() == 1));

    send_tcp(&peer, 40033, server, DEVICE_ISN + 1, relay_isn.wrapping_add(1), RST, b"");
    assert!(wait_until(REPLY_TIMEOUT, || engine.tcp_sessions() == 0));

    // The relay socket was closed
    let mut buf = [0u8; 8];
    let closed = matches!(remote.read(&mut buf), Ok(0) | Err(_));
    assert!(closed);
    assert_eq!(engine.status(), EngineStatus::Running);
}

#[test]
fn test_duplicate_syn_when_established_resets() {
    let (listener, server) = tcp_listener();
    let (engine, peer) = start_engine(test_config());

    let relay_isn = handshake(&peer, 40034, server);
    let mut remote = accept(&listener);
    assert!(wait_until(REPLY_TIMEOUT, || engine.tcp_sessions() == 1));

    send_tcp(&peer, 40034, server, DEVICE_ISN, 0, SYN, b"");
    let rst = recv_reply(&peer);
    assert_eq!(rst.flags(), RST | ACK);
    assert_eq!(rst.seq(), relay_isn.wrapping_add(1));
    assert!(wait_until(REPLY_TIMEOUT, || engine.tcp_sessions() == 0));

    let mut buf = [0u8; 8];
    let closed = matches!(remote.read(&mut buf), Ok(0) | Err(_));
    assert!(closed);
}

#[test]
fn test_duplicate_syn_while_connecting_updates_ack() {
    let (listener, server, filler) = saturated_listener();
    let (engine, peer) = start_engine(test_config());

    send_tcp(&peer, 40035, server, DEVICE_ISN, 0, SYN, b"");
    assert!(wait_until(REPLY_TIMEOUT, || engine.tcp_sessions() == 1));

    // The device retries with a fresh sequence number while connecting
    send_tcp(&peer, 40035, server, 2000, 0, SYN, b"");
    assert_silent(&peer, Duration::from_millis(200));
    assert_eq!(engine.tcp_sessions(), 1);
    assert_eq!(engine.stats().tcp_sessions_opened, 1);

    // Free the accept queue; the relay's retransmitted SYN then gets in
    let (_queued, _) = listener.accept().expect("queued connection");
    drop(filler);
    let syn_ack = recv_reply(&peer);
    assert_eq!(syn_ack.flags(), SYN | ACK);
    assert_eq!(syn_ack.ack(), 2001);
}

// ============================================================================
// Eviction Tests
// ============================================================================

#[test]
fn test_tcp_eviction_closes_least_recent_flow() {
    let (listener, server) = tcp_listener();
    let mut config = test_config();
    config.sessions.tcp_capacity = 2;
    let (engine, peer) = start_engine(config);

    let first = handshake(&peer, 40050, server);
    let mut remote_first = accept(&listener);
    handshake(&peer, 40051, server);
    let _remote_second = accept(&listener);
    assert!(wait_until(REPLY_TIMEOUT, || engine.tcp_sessions() == 2));

    handshake(&peer, 40052, server);
    let _remote_third = accept(&listener);
    assert!(wait_until(REPLY_TIMEOUT, || engine.stats().evictions == 1));
    assert_eq!(engine.tcp_sessions(), 2);
    assert_eq!(engine.stats().tcp_sessions_opened, 3);

    // The evicted flow's relay socket was closed
    let mut buf = [0u8; 8];
    assert_eq!(remote_first.read(&mut buf).unwrap(), 0);

    // and its segments are now treated as an unknown flow
    send_tcp(&peer, 40050, server, DEVICE_ISN + 1, first.wrapping_add(1), PSH | ACK, b"late");
    let rst = recv_reply_for(&peer, 40050);
    assert_eq!(rst.flags(), RST | ACK);
    assert_eq!(rst.seq(), first.wrapping_add(1));
    assert_eq!(engine.status(), EngineStatus::Running);
}

#[test]
fn test_flows_are_independent() {
    let (listener, server) = tcp_listener();
    let (engine, peer) = start_engine(test_config());

    let first = handshake(&peer, 40040, server);
    let mut remote_a = accept(&listener);
    let second = handshake(&peer, 40041, server);
    let mut remote_b = accept(&listener);
    assert!(wait_until(REPLY_TIMEOUT, || engine.tcp_sessions() == 2));

    send_tcp(&peer, 40040, server, DEVICE_ISN + 1, first.wrapping_add(1), PSH | ACK, b"a");
    let ack_a: Reply = recv_reply(&peer);
    send_tcp(&peer, 40041, server, DEVICE_ISN + 1, second.wrapping_add(1), PSH | ACK, b"b");
    let ack_b = recv_reply(&peer);

    assert_eq!(ack_a.headers.tcp().unwrap().destination_port, 40040);
    assert_eq!(ack_b.headers.tcp().unwrap().destination_port, 40041);
    assert_eq!(read_exact(&mut remote_a, 1), b"a");
    assert_eq!(read_exact(&mut remote_b, 1), b"b");
}

// ============================================================================
// Backpressure Tests
// ============================================================================

#[test]
fn test_slow_remote_does_not_stall_other_flows() {
    let (slow_listener, slow_server) = small_window_listener();
    let (listener, server) = tcp_listener();
    let (engine, peer) = start_engine(backpressure_config());

    let relay_isn = handshake(&peer, 41000, slow_server);
    let _stalled = accept(&slow_listener);
    let data = stream_data(8 * 1024 * 1024);
    push_segments(&peer, 41000, slow_server, relay_isn.wrapping_add(1), &data, 0, usize::MAX);

    let started = Instant::now();
    send_tcp(&peer, 41001, server, DEVICE_ISN, 0, SYN, b"");
    let syn_ack = recv_reply_for(&peer, 41001);
    assert_eq!(syn_ack.flags(), SYN | ACK);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "handshake took {:?}",
        started.elapsed()
    );

    let other_isn = syn_ack.seq();
    send_tcp(&peer, 41001, server, DEVICE_ISN + 1, other_isn.wrapping_add(1), ACK, b"");
    let mut remote = accept(&listener);
    send_tcp(&peer, 41001, server, DEVICE_ISN + 1, other_isn.wrapping_add(1), PSH | ACK, b"ping");
    let ack = recv_reply_for(&peer, 41001);
    assert_eq!(ack.ack(), DEVICE_ISN + 5);
    assert_eq!(read_exact(&mut remote, 4), b"ping");
}

#[test]
fn test_shutdown_is_prompt_with_unwritable_remote() {
    let (listener, server) = small_window_listener();
    let (engine, peer) = start_engine(backpressure_config());

    let relay_isn = handshake(&peer, 41010, server);
    let _stalled = accept(&listener);
    let data = stream_data(8 * 1024 * 1024);
    push_segments(&peer, 41010, server, relay_isn.wrapping_add(1), &data, 0, usize::MAX);
    acked_offset(&peer, 41010, Duration::from_millis(200), 0);

    let started = Instant::now();
    engine.shutdown();
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "shutdown took {:?}",
        started.elapsed()
    );
    assert_eq!(engine.status(), EngineStatus::Stopped);
}

#[test]
fn test_unwritten_payload_is_acknowledged_once_delivered() {
    let (listener, server) = small_window_listener();
    let (engine, peer) = start_engine(backpressure_config());

    let relay_isn = handshake(&peer, 41020, server);
    let mut remote = accept(&listener);
    let data = stream_data(8 * 1024 * 1024);
    let relay_next = relay_isn.wrapping_add(1);
    push_segments(&peer, 41020, server, relay_next, &data, 0, usize::MAX);

    // Nothing the remote has not taken is acknowledged
    let mut acked = acked_offset(&peer, 41020, Duration::from_millis(200), 0);
    assert!(acked < data.len(), "all {} bytes acknowledged", acked);
    assert_eq!(engine.tcp_sessions(), 1);

    let expected = data.clone();
    let reader = thread::spawn(move || {
        remote
            .set_read_timeout(Some(Duration::from_secs(30)))
            .expect("set read timeout");
        read_exact(&mut remote, expected.len()) == expected
    });

    // Retransmit from the acknowledged point, as the device's stack would
    let deadline = Instant::now() + Duration::from_secs(30);
    while acked < data.len() {
        assert!(Instant::now() < deadline, "stuck at {} of {}", acked, data.len());
        push_segments(&peer, 41020, server, relay_next, &data, acked, 64);
        acked = acked_offset(&peer, 41020, Duration::from_millis(20), acked);
    }

    assert!(reader.join().unwrap(), "remote received corrupted stream");
    assert_eq!(engine.stats().resets_sent, 0);
}
