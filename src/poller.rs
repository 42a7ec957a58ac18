//! Readiness multiplexer
//!
//! One [`Poller`] exists per protocol. The input worker owns the `mio::Poll`
//! and blocks in [`Poller::wait`]; every other thread reaches it through the
//! shared [`PollerHandle`], which owns a cloned `Registry`, a `Waker`, and the
//! token → session table used to dispatch events.
//!
//! Registering a socket wakes a blocked wait so it picks up the new interest
//! set immediately. [`PollerHandle::close`] wakes it for shutdown.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mio::event::{Events, Source};
use mio::{Interest, Poll, Registry, Token, Waker};
use tracing::trace;

/// Token reserved for the waker
const WAKE_TOKEN: Token = Token(0);

/// Events drained per wait
const EVENT_CAPACITY: usize = 256;

/// Owning side of a multiplexer, driven by one input worker
pub struct Poller<V> {
    poll: Poll,
    events: Events,
    handle: Arc<PollerHandle<V>>,
}

impl<V: Clone> Poller<V> {
    /// Create a multiplexer named after the worker that drives it
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poller or waker cannot be created.
    pub fn new(name: &'static str) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let registry = poll.registry().try_clone()?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            handle: Arc::new(PollerHandle {
                name,
                registry,
                waker,
                next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
                sessions: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Shared handle for registering sockets from other threads
    #[must_use]
    pub fn handle(&self) -> Arc<PollerHandle<V>> {
        Arc::clone(&self.handle)
    }

    /// Block until a registered socket is ready, the waker fires, or
    /// `timeout` elapses. Returns the ready session events; waker events are
    /// filtered out. An interrupted wait yields no events.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying wait; the caller treats it as fatal.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<Readiness<V>>> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut ready = Vec::with_capacity(self.events.iter().count());
        for event in &self.events {
            if event.token() == WAKE_TOKEN {
                trace!("{} poller woken", self.handle.name);
                continue;
            }
            // A session detached after the event was queued is skipped
            if let Some(session) = self.handle.get(event.token()) {
                ready.push(Readiness {
                    token: event.token(),
                    session,
                    readable: event.is_readable() || event.is_read_closed(),
                    writable: event.is_writable() || event.is_write_closed(),
                    error: event.is_error(),
                });
            }
        }
        Ok(ready)
    }
}

/// One ready session
#[derive(Debug, Clone)]
pub struct Readiness<V> {
    /// Token the session is registered under
    pub token: Token,
    /// The session
    pub session: V,
    /// Readable or read-closed
    pub readable: bool,
    /// Writable or write-closed
    pub writable: bool,
    /// Socket reported an error
    pub error: bool,
}

/// Shared side of a multiplexer
pub struct PollerHandle<V> {
    name: &'static str,
    registry: Registry,
    waker: Waker,
    next_token: AtomicUsize,
    sessions: DashMap<Token, V>,
    closed: AtomicBool,
}

impl<V: Clone> PollerHandle<V> {
    /// Reserve a fresh token
    pub fn allocate_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Route events for `token` to `session`
    pub fn attach(&self, token: Token, session: V) {
        self.sessions.insert(token, session);
    }

    /// Forget the session behind `token`
    pub fn detach(&self, token: Token) -> Option<V> {
        self.sessions.remove(&token).map(|(_, session)| session)
    }

    /// Session registered under `token`
    pub fn get(&self, token: Token) -> Option<V> {
        self.sessions.get(&token).map(|entry| entry.value().clone())
    }

    /// Register `source` for `interest` and wake the blocked wait
    ///
    /// # Errors
    ///
    /// Returns the registry error.
    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.register(source, token, interest)?;
        self.wake();
        Ok(())
    }

    /// Change the interest set of an already registered `source`
    ///
    /// # Errors
    ///
    /// Returns the registry error.
    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.reregister(source, token, interest)?;
        self.wake();
        Ok(())
    }

    /// Stop receiving events for `source`
    ///
    /// # Errors
    ///
    /// Returns the registry error.
    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.registry.deregister(source)
    }

    /// Interrupt a blocked wait
    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            trace!("{} poller wake failed: {}", self.name, e);
        }
    }

    /// Mark the multiplexer closed, drop every session handle and wake the
    /// waiting worker
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.sessions.clear();
        self.wake();
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of attached sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is attached
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Worker name this multiplexer belongs to
    pub const fn name(&self) -> &'static str {
        self.name
    }
}
