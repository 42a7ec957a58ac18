//! Relay engine
//!
//! An [`Engine`] owns one complete relay pipeline: the buffer pool, both
//! session tables, both readiness multiplexers and five worker threads:
//!
//! | Thread       | Role                                          |
//! |--------------|-----------------------------------------------|
//! | `tun-pump`   | device ⇄ translator queues                    |
//! | `tcp-output` | device segments → relay sockets               |
//! | `tcp-input`  | relay sockets → device segments               |
//! | `udp-output` | device datagrams → relay sockets              |
//! | `udp-input`  | relay sockets → device datagrams              |
//!
//! A sixth `relay-supervisor` thread waits for a shutdown request or a
//! worker failure and then tears the pipeline down in a fixed order:
//!
//! 1. raise the stop flag
//! 2. close both multiplexers, waking any blocked wait
//! 3. join every worker
//! 4. drain the queues and clear the buffer pool
//! 5. flush both session tables, closing every relay socket
//! 6. close the virtual interface
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tun_relay::config::Config;
//! use tun_relay::engine::EngineBuilder;
//! use tun_relay::tunnel::ChannelTun;
//!
//! let (tun, peer) = ChannelTun::pair();
//! let engine = EngineBuilder::new(Config::default()).start(Arc::new(tun))?;
//! // inject datagrams through `peer` ...
//! engine.shutdown();
//! # Ok::<(), tun_relay::RelayError>(())
//! ```

mod context;
mod stats;

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub use context::RelayContext;
pub use stats::{RelayStats, RelayStatsSnapshot};

use crate::config::Config;
use crate::error::{ConfigError, RelayError, TunnelError};
use crate::filter::{FilterMap, PacketFilter};
use crate::io::{BufferPool, PooledBuffer};
use crate::observer::{ObserverSlot, PacketObserver, TracingObserver};
use crate::packet::Packet;
use crate::poller::{Poller, PollerHandle};
use crate::protect::{self, SocketProtector};
use crate::session::{FlowKey, SessionTable};
use crate::tcp::{tcb_table, SharedTcb, TcpInput, TcpOutput};
use crate::tunnel::{TunDevice, TunnelPump};
use crate::udp::{udp_table, SharedUdpSession, UdpInput, UdpOutput};

/// Lifecycle of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// All workers running
    Running,
    /// Teardown in progress
    Stopping,
    /// Shut down on request
    Stopped,
    /// Shut down after a worker failed
    Failed,
}

impl EngineStatus {
    /// Whether teardown has finished
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Configures and starts an [`Engine`]
pub struct EngineBuilder {
    config: Config,
    protector: Option<Arc<dyn SocketProtector>>,
    filter: Option<PacketFilter>,
    observer: Option<Arc<dyn PacketObserver>>,
}

impl EngineBuilder {
    /// Start from `config`; collaborators not set explicitly are derived
    /// from it
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            protector: None,
            filter: None,
            observer: None,
        }
    }

    /// Use `protector` instead of the one described by `config.protect`
    #[must_use]
    pub fn protector(mut self, protector: Arc<dyn SocketProtector>) -> Self {
        self.protector = Some(protector);
        self
    }

    /// Use `filter` instead of the one described by `config.filter`
    #[must_use]
    pub fn filter(mut self, filter: PacketFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Report every packet to `observer`
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn PacketObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Start every worker over `device`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a filter list
    /// cannot be read, a multiplexer cannot be created or a worker thread
    /// cannot be spawned. Nothing is left running on error.
    pub fn start(self, device: Arc<dyn TunDevice>) -> Result<Engine, RelayError> {
        let config = self.config;
        config.validate()?;

        let (filter, filter_map) = match self.filter {
            Some(filter) => (Some(filter), None),
            None => match PacketFilter::from_config(&config.filter)? {
                Some((filter, map)) => (Some(filter), Some(map)),
                None => (None, None),
            },
        };
        let observer = self
            .observer
            .or_else(|| {
                config
                    .log
                    .packets
                    .then(|| Arc::new(TracingObserver) as Arc<dyn PacketObserver>)
            })
            .map(ObserverSlot::new);
        let protector = self
            .protector
            .unwrap_or_else(|| protect::from_config(&config.protect));

        let pool = Arc::new(BufferPool::new(config.pool.buffer_size));
        pool.prewarm(config.pool.prewarm);

        let (device_tx, device_rx) = unbounded::<PooledBuffer>();
        let (tcp_tx, tcp_rx) = unbounded::<Packet>();
        let (udp_tx, udp_rx) = unbounded::<Packet>();
        let ctx = RelayContext::new(&config, Arc::clone(&pool), device_tx, protector);

        let tcp_poller: Poller<SharedTcb> =
            Poller::new("tcp-input").map_err(|e| TunnelError::multiplexer("tcp-input", e))?;
        let udp_poller: Poller<SharedUdpSession> =
            Poller::new("udp-input").map_err(|e| TunnelError::multiplexer("udp-input", e))?;

        let tcp_table = Arc::new(tcb_table(
            capacity("sessions.tcp_capacity", config.sessions.tcp_capacity)?,
            tcp_poller.handle(),
            Arc::clone(&ctx.stats),
        ));
        let udp_table = Arc::new(udp_table(
            capacity("sessions.udp_capacity", config.sessions.udp_capacity)?,
            udp_poller.handle(),
            Arc::clone(&ctx.stats),
        ));

        let inner = Arc::new(Inner {
            ctx: ctx.clone(),
            tcp_table: Arc::clone(&tcp_table),
            udp_table: Arc::clone(&udp_table),
            tcp_poller: tcp_poller.handle(),
            udp_poller: udp_poller.handle(),
            device: Arc::clone(&device),
            queues: Queues {
                device_rx: device_rx.clone(),
                tcp_rx: tcp_rx.clone(),
                udp_rx: udp_rx.clone(),
            },
            state: Mutex::new(State {
                status: EngineStatus::Running,
                failure: None,
            }),
            changed: Condvar::new(),
            workers: Mutex::new(Vec::new()),
        });

        let pump = TunnelPump::new(ctx.clone(), device, device_rx, tcp_tx, udp_tx)
            .with_filter(filter)
            .with_observer(observer.clone());
        let tcp_output = TcpOutput::new(
            ctx.clone(),
            tcp_rx,
            Arc::clone(&tcp_table),
            tcp_poller.handle(),
        );
        let tcp_input = TcpInput::new(ctx.clone(), tcp_poller, Arc::clone(&tcp_table));
        let udp_output = UdpOutput::new(
            ctx.clone(),
            udp_rx,
            Arc::clone(&udp_table),
            udp_poller.handle(),
        );
        let udp_input = UdpInput::new(ctx, udp_poller, Arc::clone(&udp_table));

        let spawned = spawn_worker(&inner, "tun-pump", move || pump.run())
            .and_then(|()| spawn_worker(&inner, "tcp-input", move || tcp_input.run()))
            .and_then(|()| spawn_worker(&inner, "tcp-output", move || tcp_output.run()))
            .and_then(|()| spawn_worker(&inner, "udp-input", move || udp_input.run()))
            .and_then(|()| spawn_worker(&inner, "udp-output", move || udp_output.run()));

        let supervisor = spawned.and_then(|()| {
            let supervised = Arc::clone(&inner);
            thread::Builder::new()
                .name("relay-supervisor".into())
                .spawn(move || supervised.supervise())
                .map_err(|e| TunnelError::Spawn {
                    worker: "relay-supervisor",
                    reason: e.to_string(),
                })
        });

        let supervisor = match supervisor {
            Ok(handle) => handle,
            Err(e) => {
                inner.request_shutdown(Some(e.to_string()));
                inner.teardown();
                return Err(e.into());
            }
        };

        info!(
            "Relay engine started (tcp capacity {}, udp capacity {}, buffer {} bytes)",
            tcp_table.capacity(),
            udp_table.capacity(),
            pool.buffer_size()
        );

        Ok(Engine {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
            pool,
            filter_map,
            observer,
        })
    }
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("protector", &self.protector)
            .field("filter", &self.filter)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

fn capacity(field: &str, value: usize) -> Result<NonZeroUsize, ConfigError> {
    NonZeroUsize::new(value)
        .ok_or_else(|| ConfigError::ValidationError(format!("{field} must be greater than 0")))
}

/// Running relay pipeline.
///
/// Dropping the engine shuts it down.
pub struct Engine {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    pool: Arc<BufferPool>,
    filter_map: Option<Arc<FilterMap>>,
    observer: Option<ObserverSlot>,
}

impl Engine {
    /// Current lifecycle state
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        self.inner.state.lock().status
    }

    /// Reason of the worker failure that stopped the engine, if any
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.inner.state.lock().failure.clone()
    }

    /// Stop every worker, close every socket and the virtual interface.
    ///
    /// Blocks until teardown has finished. Idempotent.
    pub fn shutdown(&self) {
        self.inner.request_shutdown(None);
        if let Some(handle) = self.supervisor.lock().take() {
            if handle.join().is_err() {
                error!("Relay supervisor panicked");
            }
        }
    }

    /// Block until the engine has stopped, either on request or because a
    /// worker failed. Returns `None` if `timeout` elapses first.
    #[must_use]
    pub fn wait_stopped(&self, timeout: Duration) -> Option<EngineStatus> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.status.is_terminal() {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                return state.status.is_terminal().then_some(state.status);
            }
        }
        Some(state.status)
    }

    /// Relay counters
    #[must_use]
    pub fn stats(&self) -> RelayStatsSnapshot {
        self.inner.ctx.stats.snapshot()
    }

    /// Packet buffer pool
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Number of live TCP control blocks
    #[must_use]
    pub fn tcp_sessions(&self) -> usize {
        self.inner.tcp_table.len()
    }

    /// Number of live UDP sessions
    #[must_use]
    pub fn udp_sessions(&self) -> usize {
        self.inner.udp_table.len()
    }

    /// Filter map loaded from the configured list files, for hot reloads
    #[must_use]
    pub fn filter_map(&self) -> Option<&Arc<FilterMap>> {
        self.filter_map.as_ref()
    }

    /// Number of packet observer panics contained so far
    #[must_use]
    pub fn observer_panics(&self) -> u64 {
        self.observer.as_ref().map_or(0, ObserverSlot::panics)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("status", &self.status())
            .field("tcp_sessions", &self.tcp_sessions())
            .field("udp_sessions", &self.udp_sessions())
            .finish_non_exhaustive()
    }
}

struct State {
    status: EngineStatus,
    failure: Option<String>,
}

/// Receivers kept so queued buffers can be released at teardown
struct Queues {
    device_rx: Receiver<PooledBuffer>,
    tcp_rx: Receiver<Packet>,
    udp_rx: Receiver<Packet>,
}

impl Queues {
    fn drain(&self) -> usize {
        self.device_rx.try_iter().count()
            + self.tcp_rx.try_iter().count()
            + self.udp_rx.try_iter().count()
    }
}

struct Inner {
    ctx: RelayContext,
    tcp_table: Arc<SessionTable<FlowKey, SharedTcb>>,
    udp_table: Arc<SessionTable<FlowKey, SharedUdpSession>>,
    tcp_poller: Arc<PollerHandle<SharedTcb>>,
    udp_poller: Arc<PollerHandle<SharedUdpSession>>,
    device: Arc<dyn TunDevice>,
    queues: Queues,
    state: Mutex<State>,
    changed: Condvar,
    workers: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Inner {
    /// Move to `Stopping` and wake the supervisor. A `failure` is recorded
    /// even if shutdown was already requested.
    fn request_shutdown(&self, failure: Option<String>) {
        let mut state = self.state.lock();
        if let Some(reason) = failure {
            state.failure.get_or_insert(reason);
        }
        if state.status == EngineStatus::Running {
            state.status = EngineStatus::Stopping;
        }
        drop(state);
        self.ctx.request_stop();
        self.changed.notify_all();
    }

    fn supervise(&self) {
        {
            let mut state = self.state.lock();
            while state.status == EngineStatus::Running {
                self.changed.wait(&mut state);
            }
        }
        self.teardown();
    }

    fn teardown(&self) {
        info!("Relay engine stopping");
        self.ctx.request_stop();

        self.tcp_poller.close();
        self.udp_poller.close();

        let workers = std::mem::take(&mut *self.workers.lock());
        for (name, handle) in workers {
            if handle.join().is_err() {
                warn!("Worker {} panicked", name);
            }
        }

        let drained = self.queues.drain();
        if drained > 0 {
            debug!("Released {} queued buffers", drained);
        }
        self.ctx.pool.clear();

        let tcp = self.tcp_table.flush();
        let udp = self.udp_table.flush();
        debug!("Closed {} TCP and {} UDP sessions", tcp, udp);

        self.device.close();

        let mut state = self.state.lock();
        state.status = if state.failure.is_some() {
            EngineStatus::Failed
        } else {
            EngineStatus::Stopped
        };
        info!("Relay engine {}", state.status);
        drop(state);
        self.changed.notify_all();
    }
}

/// Reports a panicking worker so the engine does not keep running half
/// a pipeline
struct PanicGuard {
    inner: Arc<Inner>,
    name: &'static str,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("Worker {} panicked", self.name);
            self.inner
                .request_shutdown(Some(format!("worker {} panicked", self.name)));
        }
    }
}

fn spawn_worker<F>(inner: &Arc<Inner>, name: &'static str, run: F) -> Result<(), TunnelError>
where
    F: FnOnce() -> Result<(), TunnelError> + Send + 'static,
{
    let guard = PanicGuard {
        inner: Arc::clone(inner),
        name,
    };
    let handle = thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            let guard = guard;
            if let Err(e) = run() {
                error!("Worker {} failed: {}", name, e);
                guard.inner.request_shutdown(Some(e.to_string()));
            }
        })
        .map_err(|e| TunnelError::Spawn {
            worker: name,
            reason: e.to_string(),
        })?;
    inner.workers.lock().push((name, handle));
    Ok(())
}
