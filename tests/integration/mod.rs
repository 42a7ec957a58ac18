//! Integration tests for tun-relay
//!
//! Every test runs a complete engine over an in-memory tunnel
//! ([`tun_relay::ChannelTun`]) against loopback servers, so the suite needs
//! neither `CAP_NET_ADMIN` nor network access.
//!
//! # Test Organization
//!
//! - `support`: engine startup, datagram builders and loopback servers
//! - `tcp_relay`: handshake, data transfer, close and reset handling
//! - `udp_relay`: datagram relaying, session reuse and eviction
//! - `filter_pipeline`: filter verdicts, list files and packet observers
//! - `teardown`: shutdown and device failure cleanup
//!
//! # Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test --test integration_tests
//!
//! # Run specific test module
//! cargo test --test integration_tests tcp_relay
//! ```

pub mod filter_pipeline;
pub mod support;
pub mod tcp_relay;
pub mod teardown;
pub mod udp_relay;
