//! Connection registry for the relay.
//!
//! The registry is the sole owner of every live connection, and each
//! connection is the sole owner of its outbound queue. Alongside the slab of
//! connections it keeps the two interest sets that drive the readiness wait:
//!
//! - read-interest: every live handle, for its whole lifetime
//! - write-interest: exactly the handles whose outbound queue is non-empty
//!
//! Interest changes are recorded so the event loop can bring the OS-level
//! registration in line before the next wait.

use crate::runtime::error::RegistryError;
use crate::runtime::queue::OutboundQueue;
use mio::Token;
use slab::Slab;
use std::collections::BTreeSet;
use std::fmt;
use tracing::trace;

/// Identifier of one accepted peer.
///
/// Unique among live connections. A handle may be reused after its
/// connection has been removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(usize);

impl Handle {
    pub fn new(raw: usize) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Handle> for Token {
    fn from(handle: Handle) -> Self {
        Token(handle.0)
    }
}

impl From<Token> for Handle {
    fn from(token: Token) -> Self {
        Handle::new(token.0)
    }
}

/// A single accepted peer.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    queue: OutboundQueue,
}

impl<S> Connection<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            queue: OutboundQueue::new(),
        }
    }

    #[cfg(test)]
    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Split borrow used by the drain path.
    pub(crate) fn parts_mut(&mut self) -> (&mut S, &mut OutboundQueue) {
        (&mut self.stream, &mut self.queue)
    }

    pub(crate) fn queue_mut(&mut self) -> &mut OutboundQueue {
        &mut self.queue
    }
}

/// Outcome of a successful `remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removed {
    pub handle: Handle,
    /// Queued messages released without being sent.
    pub discarded: usize,
}

/// Registry of live connections keyed by handle.
///
/// O(1) insert and lookup through the slab; the highest live handle is
/// recomputed by a full scan only when the current maximum is removed.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
    highest: Option<Handle>,
    read_interest: BTreeSet<Handle>,
    write_interest: BTreeSet<Handle>,
    /// Handles whose OS registration must be refreshed before the next wait.
    reregister: Vec<Handle>,
}

impl<S> ConnectionRegistry<S> {
    /// Create an empty registry that admits at most `max_connections` peers.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::new(),
            max_connections,
            highest: None,
            read_interest: BTreeSet::new(),
            write_interest: BTreeSet::new(),
            reregister: Vec::new(),
        }
    }

    /// Register a newly accepted stream and return its handle.
    ///
    /// The connection starts with an empty queue and read-interest only.
    pub fn add(&mut self, stream: S) -> Result<Handle, RegistryError> {
        if self.connections.len() >= self.max_connections {
            return Err(RegistryError::ConnectionLimit {
                limit: self.max_connections,
            });
        }

        let entry = self.connections.vacant_entry();
        let handle = Handle(entry.key());
        entry.insert(Connection::new(stream));

        self.read_interest.insert(handle);
        if self.highest.map_or(true, |highest| handle > highest) {
            self.highest = Some(handle);
        }

        trace!(%handle, live = self.connections.len(), "Connection registered");
        Ok(handle)
    }

    /// Tear down a connection.
    ///
    /// Clears both interest sets, releases every queued message and drops the
    /// stream, which closes the underlying socket. Unknown handles report
    /// `NotFound` and leave the registry untouched.
    pub fn remove(&mut self, handle: Handle) -> Result<Removed, RegistryError> {
        let conn = self
            .connections
            .try_remove(handle.0)
            .ok_or(RegistryError::NotFound(handle))?;

        self.read_interest.remove(&handle);
        self.write_interest.remove(&handle);
        self.reregister.retain(|&h| h != handle);

        if self.highest == Some(handle) {
            self.highest = self.connections.iter().map(|(key, _)| Handle(key)).max();
        }

        let discarded = conn.queue.len();
        drop(conn);

        trace!(%handle, discarded, live = self.connections.len(), "Connection removed");
        Ok(Removed { handle, discarded })
    }

    #[cfg(test)]
    pub fn get(&self, handle: Handle) -> Option<&Connection<S>> {
        self.connections.get(handle.0)
    }

    pub(crate) fn get_mut(&mut self, handle: Handle) -> Option<&mut Connection<S>> {
        self.connections.get_mut(handle.0)
    }

    pub fn stream_mut(&mut self, handle: Handle) -> Option<&mut S> {
        self.connections.get_mut(handle.0).map(|c| &mut c.stream)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.connections.contains(handle.0)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Highest live handle, or `None` when the registry is empty.
    pub fn highest(&self) -> Option<Handle> {
        self.highest
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Live handles in ascending order.
    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.read_interest.iter().copied()
    }

    /// Number of messages queued for `handle`.
    #[cfg(test)]
    pub fn queued(&self, handle: Handle) -> Option<usize> {
        self.get(handle).map(|c| c.queue.len())
    }

    pub fn wants_read(&self, handle: Handle) -> bool {
        self.read_interest.contains(&handle)
    }

    pub fn wants_write(&self, handle: Handle) -> bool {
        self.write_interest.contains(&handle)
    }

    pub(crate) fn set_write_interest(&mut self, handle: Handle) {
        if self.write_interest.insert(handle) {
            self.reregister.push(handle);
        }
    }

    pub(crate) fn clear_write_interest(&mut self, handle: Handle) {
        if self.write_interest.remove(&handle) {
            self.reregister.push(handle);
        }
    }

    /// Ask for the handle's readiness registration to be refreshed even
    /// though its interest did not change.
    pub(crate) fn request_rearm(&mut self, handle: Handle) {
        if self.contains(handle) {
            self.reregister.push(handle);
        }
    }

    /// Handles whose registration is stale, each listed once, ascending.
    pub fn take_reregistrations(&mut self) -> Vec<Handle> {
        let mut handles = std::mem::take(&mut self.reregister);
        handles.sort_unstable();
        handles.dedup();
        handles
    }

    /// Check the bookkeeping invariants against the live connections.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let live: BTreeSet<Handle> = self.connections.iter().map(|(k, _)| Handle(k)).collect();
        assert_eq!(self.read_interest, live, "read-interest must cover every live handle");
        assert_eq!(self.highest, live.iter().next_back().copied());
        for (key, conn) in self.connections.iter() {
            assert_eq!(
                self.write_interest.contains(&Handle(key)),
                !conn.queue.is_empty(),
                "write-interest must match a non-empty queue for {key}"
            );
        }
        assert!(self.write_interest.is_subset(&live));
    }
}
