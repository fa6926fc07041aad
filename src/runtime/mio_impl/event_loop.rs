//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us which sockets are ready, then we
//! perform non-blocking accept/read/write syscalls on the single loop thread.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Each cycle:
//! 1. stop if the shutdown token is set
//! 2. wait for readiness (bounded by the poll timeout)
//! 3. dispatch ready handles in ascending order, stopping once the number of
//!    handled events matches the number reported
//! 4. refresh OS registrations for handles whose interest changed
//!
//! mio readiness is edge-triggered. A connection is re-armed after every
//! positive read so that one buffer-sized chunk is consumed per wakeup without
//! stranding bytes (or a pending EOF) that were already buffered.

use crate::config::{Config, WriteErrorPolicy};
use crate::runtime::{ConnectionRegistry, DrainOutcome, Handle, RegistryError, SetupError, Shutdown};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

// Reserved tokens sit above every slab key, so they sort after all connections
// and a stale event can never land on a reused connection handle.
const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Readiness of one token within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Self {
        Self {
            token: event.token(),
            // Hang-ups and socket errors surface through the read path.
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable(),
        }
    }

    /// Events this entry accounts for in the ready count.
    fn weight(&self) -> usize {
        usize::from(self.readable) + usize::from(self.writable)
    }
}

/// Merge per-token readiness and sort by token, lowest first.
///
/// kqueue reports read and write readiness as separate events for the same
/// token; they are folded into one entry.
pub(crate) fn in_dispatch_order(ready: impl IntoIterator<Item = Readiness>) -> Vec<Readiness> {
    let mut ready: Vec<Readiness> = ready.into_iter().collect();
    ready.sort_by_key(|r| r.token.0);
    ready.dedup_by(|next, kept| {
        if next.token == kept.token {
            kept.readable |= next.readable;
            kept.writable |= next.writable;
            true
        } else {
            false
        }
    });
    ready
}

/// Leading entries of `ready` handled before the running event count
/// reaches `reported`.
///
/// Entries are in ascending token order, so when fewer events are reported
/// than are listed, the low handles are the ones served.
pub(crate) fn within_reported(ready: &[Readiness], reported: usize) -> &[Readiness] {
    let mut handled = 0;
    let end = ready
        .iter()
        .position(|r| {
            let done = handled >= reported;
            handled += r.weight();
            done
        })
        .unwrap_or(ready.len());
    &ready[..end]
}

/// The relay's connection multiplexer.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    registry: ConnectionRegistry<TcpStream>,
    read_buf: Vec<u8>,
    poll_timeout: Duration,
    write_error_policy: WriteErrorPolicy,
    shutdown: Shutdown,
}

impl Multiplexer {
    /// Bind the listening socket and prepare the poll.
    pub fn bind(config: &Config, shutdown: Shutdown) -> Result<Self, SetupError> {
        let addr = SocketAddr::new(config.host, config.port);

        let poll = Poll::new().map_err(SetupError::Poll)?;
        let listener =
            create_listener(addr).map_err(|source| SetupError::Listen { addr, source })?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|source| SetupError::Listen { addr, source })?;

        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(SetupError::Poll)?;
        if !shutdown.attach(waker) {
            warn!("Shutdown token already bound to another loop; relying on poll timeout");
        }

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity),
            listener,
            registry: ConnectionRegistry::new(config.max_connections),
            read_buf: vec![0u8; config.buffer_size],
            poll_timeout: config.poll_timeout,
            write_error_policy: config.write_error_policy,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until the shutdown token fires, then close every connection.
    pub fn run(mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            max_connections = self.registry.capacity(),
            buffer_size = self.read_buf.len(),
            policy = ?self.write_error_policy,
            "Relay loop started"
        );

        while !self.shutdown.is_triggered() {
            if let Err(e) = self.turn() {
                error!(error = %e, "Readiness wait failed");
                self.teardown();
                return Err(e);
            }
        }

        self.teardown();
        Ok(())
    }

    /// One cycle: wait for readiness, dispatch, refresh registrations.
    ///
    /// An interrupted wait is a no-op cycle.
    fn turn(&mut self) -> io::Result<()> {
        trace!(highest = ?self.registry.highest(), live = self.registry.len(), "Waiting for readiness");

        match self.poll.poll(&mut self.events, Some(self.poll_timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                debug!("Readiness wait interrupted");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let ready = in_dispatch_order(self.events.iter().map(Readiness::from_event));
        let reported: usize = ready.iter().map(Readiness::weight).sum();
        self.dispatch(&ready, reported);
        self.sync_registrations();
        Ok(())
    }

    /// Handle the ready entries that fit within `reported`, returning how
    /// many events were handled.
    fn dispatch(&mut self, ready: &[Readiness], reported: usize) -> usize {
        let mut handled = 0;

        for r in within_reported(ready, reported) {
            match r.token {
                WAKER_TOKEN => {
                    trace!("Woken by shutdown token");
                }
                LISTENER_TOKEN => {
                    self.accept_connections();
                }
                token => {
                    let handle = Handle::from(token);
                    if r.readable && self.registry.wants_read(handle) {
                        self.handle_readable(handle);
                    }
                    if r.writable {
                        self.handle_writable(handle);
                    }
                }
            }
            handled += r.weight();
        }

        handled
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let handle = match self.registry.add(stream) {
                        Ok(handle) => handle,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Rejecting connection");
                            continue;
                        }
                    };

                    let registered = match self.registry.stream_mut(handle) {
                        Some(stream) => {
                            self.poll
                                .registry()
                                .register(stream, handle.into(), Interest::READABLE)
                        }
                        None => continue,
                    };

                    match registered {
                        Ok(()) => {
                            info!(%handle, peer = %peer, live = self.registry.len(), "New connection")
                        }
                        Err(e) => {
                            warn!(%handle, peer = %peer, error = %e, "Failed to register connection");
                            let _ = self.registry.remove(handle);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, handle: Handle) {
        let Some(stream) = self.registry.stream_mut(handle) else {
            return;
        };

        match stream.read(&mut self.read_buf) {
            Ok(0) => {
                info!(%handle, "Connection closed by peer");
                self.close_connection(handle);
            }
            Ok(n) => {
                debug!(%handle, bytes = n, "Received");
                self.registry.request_rearm(handle);
                match self.registry.broadcast(handle, &self.read_buf[..n]) {
                    Ok(recipients) => trace!(%handle, recipients, "Fanned out"),
                    Err(e) => warn!(%handle, error = %e, "Broadcast incomplete"),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(%handle, "Spurious read readiness");
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                self.registry.request_rearm(handle);
            }
            Err(e) => {
                warn!(%handle, error = %e, "Read failed");
                // Edge-triggered: without a re-arm a reset peer is never read again.
                self.registry.request_rearm(handle);
            }
        }
    }

    fn handle_writable(&mut self, handle: Handle) {
        match self.registry.drain(handle) {
            Ok(DrainOutcome::Flushed { messages, bytes }) => {
                trace!(%handle, messages, bytes, "Queue flushed");
            }
            Ok(DrainOutcome::Blocked { bytes, remaining }) => {
                trace!(%handle, bytes, remaining, "Write would block");
            }
            Ok(DrainOutcome::Failed { error, discarded }) => {
                warn!(%handle, error = %error, discarded, "Write failed, queued messages dropped");
                if self.write_error_policy == WriteErrorPolicy::Close {
                    self.close_connection(handle);
                }
            }
            Err(RegistryError::NotFound(_)) => {
                trace!(%handle, "Write readiness for a closed connection");
            }
            Err(e) => {
                warn!(%handle, error = %e, "Drain failed");
            }
        }
    }

    /// Bring each stale OS registration in line with the registry's interest sets.
    fn sync_registrations(&mut self) {
        for handle in self.registry.take_reregistrations() {
            let interest = if self.registry.wants_write(handle) {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let Some(stream) = self.registry.stream_mut(handle) else {
                continue;
            };
            if let Err(e) = self
                .poll
                .registry()
                .reregister(stream, handle.into(), interest)
            {
                warn!(%handle, error = %e, "Failed to update readiness registration");
            }
        }
    }

    fn close_connection(&mut self, handle: Handle) {
        if let Some(stream) = self.registry.stream_mut(handle) {
            let _ = self.poll.registry().deregister(stream);
        }
        match self.registry.remove(handle) {
            Ok(removed) => debug!(
                %handle,
                discarded = removed.discarded,
                live = self.registry.len(),
                "Connection closed"
            ),
            Err(e) => trace!(%handle, error = %e, "Close skipped"),
        }
    }

    fn teardown(&mut self) {
        let handles: Vec<Handle> = self.registry.handles().collect();
        let count = handles.len();
        for handle in handles {
            self.close_connection(handle);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
        info!(closed = count, "Relay loop stopped");
    }
}

/// Create a non-blocking TCP listener with the platform's maximum backlog.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;

    Ok(socket.into())
}
