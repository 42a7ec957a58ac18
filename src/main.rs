//! tun-relay: socket-based NAT relay for a TUN interface
//!
//! This is the main entry point for the relay daemon.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./tun-relay
//!
//! # Run with custom configuration
//! sudo ./tun-relay -c /path/to/config.json
//!
//! # Run with environment overrides
//! TUN_RELAY_LOG_LEVEL=debug sudo ./tun-relay
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tun_relay::config::{load_config_with_env, Config};
use tun_relay::engine::{EngineBuilder, EngineStatus};
use tun_relay::tunnel::FdTun;

/// How often the main task checks for a worker failure
const STATUS_INTERVAL: Duration = Duration::from_millis(250);

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tun-relay/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tun-relay v{}", tun_relay::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", arg);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"tun-relay v{}

Relays all traffic entering a TUN interface over ordinary TCP/UDP sockets.

USAGE:
    tun-relay [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tun-relay/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    TUN_RELAY_TUN_NAME          Override TUN interface name
    TUN_RELAY_LOG_LEVEL         Override log level (trace, debug, info, warn, error)
    TUN_RELAY_ROUTING_MARK      Override SO_MARK applied to relay sockets
    TUN_RELAY_FILTER_ENABLED    Enable or disable the host filter (true/false)
    RUST_LOG                    Fine-grained tracing filter, overrides the log level

REQUIREMENTS:
    - Linux with /dev/net/tun
    - CAP_NET_ADMIN capability (or root)
    - A routing mark or bound interface that keeps relay sockets out of the
      tunnel when it captures the default route

EXAMPLE:
    # Keep marked relay traffic on the main table
    ip rule add fwmark 0x1 lookup main priority 100

    # Run the relay
    sudo tun-relay -c /etc/tun-relay/config.json
"#,
        tun_relay::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    // Parse arguments
    let args = Args::parse();

    // Handle generate-config
    if args.generate_config {
        tun_relay::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    // Load configuration
    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    // Handle check-config
    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    // Initialize logging
    init_logging(&config);

    info!("tun-relay v{}", tun_relay::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    if !config.protect.is_enabled() {
        warn!("No routing mark or bind interface configured; relay sockets may loop into the tunnel");
    }

    let tun = open_tun(&config)?;
    let engine = EngineBuilder::new(config)
        .start(tun)
        .map_err(|e| anyhow::anyhow!("Failed to start relay engine: {}", e))?;

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    // Run until a signal arrives or the engine stops on its own
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            () = tokio::time::sleep(STATUS_INTERVAL) => {
                if engine.status() != EngineStatus::Running {
                    break;
                }
            }
        }
    }

    // Graceful shutdown
    info!("Shutting down...");
    tokio::task::block_in_place(|| engine.shutdown());

    let stats = engine.stats();
    info!(
        "Final stats: {} packets in, {} packets out, {} TCP / {} UDP sessions, {} filtered",
        stats.packets_from_device,
        stats.packets_to_device,
        stats.tcp_sessions_opened,
        stats.udp_sessions_opened,
        stats.filtered
    );

    if let Some(reason) = engine.failure() {
        error!("Relay engine failed: {}", reason);
        return Err(anyhow::anyhow!("Relay engine failed: {}", reason));
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(target_os = "linux")]
fn open_tun(config: &Config) -> Result<Arc<FdTun>> {
    let tun = FdTun::open(&config.tunnel.name)?;
    tun_relay::tunnel::configure_interface(tun.name(), &config.tunnel)?;
    Ok(Arc::new(tun))
}

#[cfg(not(target_os = "linux"))]
fn open_tun(_config: &Config) -> Result<Arc<FdTun>> {
    Err(anyhow::anyhow!(
        "Opening a TUN device is only supported on Linux; embed the library with a platform descriptor instead"
    ))
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT, initiating shutdown..."),
        () = wait_for_sigterm() => info!("Received SIGTERM, initiating shutdown..."),
    }
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await
}
