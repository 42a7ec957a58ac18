//! Filter and observer integration tests
//!
//! Exercises the per-packet verdict path between the tunnel pump and the
//! translators, with both closure filters and list files.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use tun_relay::filter::{LiteralResolver, PacketFilter};
use tun_relay::packet::tcp_flags::SYN;
use tun_relay::{EngineBuilder, Packet, Verdict};

use super::support::{
    assert_silent, recv_reply, send_tcp, send_udp, start_engine, start_with, test_config,
    udp_echo_server, wait_until, REPLY_TIMEOUT,
};

fn list_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn closure_filter(f: impl Fn(&str) -> Verdict + Send + Sync + 'static) -> PacketFilter {
    PacketFilter {
        filter: Arc::new(f),
        resolver: Arc::new(LiteralResolver),
    }
}

#[test]
fn test_denied_destination_is_dropped() {
    let server = udp_echo_server();
    let filter = closure_filter(|host| {
        if host == "127.0.0.1" {
            Verdict::Deny
        } else {
            Verdict::Unknown
        }
    });
    let (engine, peer) = start_with(EngineBuilder::new(test_config()).filter(filter));

    send_udp(&peer, 54000, server, b"blocked");
    assert_silent(&peer, Duration::from_millis(200));

    let stats = engine.stats();
    assert_eq!(stats.filtered, 1);
    assert_eq!(stats.udp_sessions_opened, 0);
    assert_eq!(engine.udp_sessions(), 0);
}

#[test]
fn test_denied_syn_opens_no_connection() {
    let (listener, server) = super::support::tcp_listener();
    listener.set_nonblocking(true).unwrap();
    let filter = closure_filter(|_| Verdict::Deny);
    let (engine, peer) = start_with(EngineBuilder::new(test_config()).filter(filter));

    send_tcp(&peer, 54001, server, 1, 0, SYN, b"");
    assert_silent(&peer, Duration::from_millis(200));

    // Filtered datagrams never reach the translator, so no reset either
    assert!(listener.accept().is_err());
    assert_eq!(engine.stats().filtered, 1);
    assert_eq!(engine.stats().resets_sent, 0);
}

#[test]
fn test_allowed_and_unknown_are_forwarded() {
    let server = udp_echo_server();
    let verdict = Arc::new(Mutex::new(Verdict::Allow));
    let current = Arc::clone(&verdict);
    let filter = closure_filter(move |_| *current.lock());
    let (engine, peer) = start_with(EngineBuilder::new(test_config()).filter(filter));

    send_udp(&peer, 54002, server, b"allowed");
    assert_eq!(recv_reply(&peer).payload, b"ALLOWED");

    *verdict.lock() = Verdict::Unknown;
    send_udp(&peer, 54002, server, b"unknown");
    assert_eq!(recv_reply(&peer).payload, b"UNKNOWN");

    assert_eq!(engine.stats().filtered, 0);
}

#[test]
fn test_blacklist_file_from_config() {
    let server = udp_echo_server();
    let blacklist = list_file("# blocked hosts\n127.0.0.2\n");

    let mut config = test_config();
    config.filter.enabled = true;
    config.filter.blacklist_file = Some(blacklist.path().to_path_buf());
    let (engine, peer) = start_engine(config);

    let map = engine.filter_map().expect("filter map loaded from config");
    assert_eq!(map.len(), 1);

    // Listed destination is dropped
    send_udp(&peer, 54003, SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 2), 9), b"nope");
    assert!(wait_until(REPLY_TIMEOUT, || engine.stats().filtered == 1));

    // Anything else passes
    send_udp(&peer, 54003, server, b"fine");
    assert_eq!(recv_reply(&peer).payload, b"FINE");

    let lookups = map.stats().snapshot();
    assert_eq!(lookups.denied, 1);
    assert_eq!(lookups.unknown, 1);
}

#[test]
fn test_filter_map_reload_while_running() {
    let server = udp_echo_server();
    let blacklist = list_file("127.0.0.2\n");

    let mut config = test_config();
    config.filter.enabled = true;
    config.filter.blacklist_file = Some(blacklist.path().to_path_buf());
    let (engine, peer) = start_engine(config);

    send_udp(&peer, 54004, server, b"before");
    assert_eq!(recv_reply(&peer).payload, b"BEFORE");

    let map = engine.filter_map().unwrap();
    map.replace([("127.0.0.1".to_string(), false)].into());

    send_udp(&peer, 54005, server, b"after");
    assert_silent(&peer, Duration::from_millis(200));
    assert_eq!(engine.stats().filtered, 1);
}

#[test]
fn test_missing_list_file_fails_start() {
    let mut config = test_config();
    config.filter.enabled = true;
    config.filter.hosts_file = Some("/nonexistent/tun-relay/hosts.txt".into());

    let (tun, _peer) = tun_relay::ChannelTun::pair();
    let err = EngineBuilder::new(config).start(Arc::new(tun)).unwrap_err();
    assert!(err.to_string().contains("hosts.txt"));
}

#[test]
fn test_observer_sees_every_packet_with_verdict() {
    let server = udp_echo_server();
    let seen: Arc<Mutex<Vec<(u16, Option<Verdict>)>>> = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let observer = move |packet: &Packet, verdict: Option<Verdict>| {
        let port = packet.udp().map_or(0, |u| u.source_port);
        record.lock().push((port, verdict));
    };

    let filter = closure_filter(|_| Verdict::Unknown);
    let (_engine, peer) = start_with(
        EngineBuilder::new(test_config())
            .filter(filter)
            .observer(Arc::new(observer)),
    );

    send_udp(&peer, 54010, server, b"one");
    recv_reply(&peer);
    send_udp(&peer, 54011, server, b"two");
    recv_reply(&peer);

    let seen = seen.lock();
    assert_eq!(
        *seen,
        vec![(54010, Some(Verdict::Unknown)), (54011, Some(Verdict::Unknown))]
    );
}

#[test]
fn test_panicking_observer_does_not_stop_relay() {
    let server = udp_echo_server();
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let observer = move |_: &Packet, _: Option<Verdict>| {
        counted.fetch_add(1, Ordering::SeqCst);
        panic!("observer failure");
    };
    let (engine, peer) = start_with(EngineBuilder::new(test_config()).observer(Arc::new(observer)));

    send_udp(&peer, 54020, server, b"still");
    assert_eq!(recv_reply(&peer).payload, b"STILL");
    send_udp(&peer, 54020, server, b"works");
    assert_eq!(recv_reply(&peer).payload, b"WORKS");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.observer_panics(), 2);
    assert_eq!(engine.status(), tun_relay::EngineStatus::Running);
}
