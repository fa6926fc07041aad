//! Per-connection outbound queue.
//!
//! Each connection owns one `OutboundQueue`. Messages are appended at the tail
//! by the broadcast path and consumed from the head by the drain path. The head
//! message remembers how many of its bytes have already been written, so a
//! short write resumes at the right offset instead of restarting the message.

use bytes::Bytes;
use std::collections::{TryReserveError, VecDeque};

/// One unit of data queued for a single recipient.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    payload: Bytes,
    /// Bytes of `payload` already handed to the transport.
    written: usize,
}

impl PendingMessage {
    /// Wrap an owned payload. Nothing has been written yet.
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            written: 0,
        }
    }

    /// Build a message holding its own copy of `data`.
    ///
    /// Fails instead of aborting when the copy cannot be allocated.
    pub fn copy_from(data: &[u8]) -> Result<Self, TryReserveError> {
        let mut owned = Vec::new();
        owned.try_reserve_exact(data.len())?;
        owned.extend_from_slice(data);
        Ok(Self::new(Bytes::from(owned)))
    }

    /// Total payload length.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Offset of the next byte to write.
    #[cfg(test)]
    pub fn written(&self) -> usize {
        self.written
    }

    /// Bytes still waiting to be written.
    pub fn remaining(&self) -> &[u8] {
        &self.payload[self.written..]
    }

    /// Record that `n` more bytes reached the transport.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.written + n <= self.payload.len());
        self.written = (self.written + n).min(self.payload.len());
    }

    pub fn is_complete(&self) -> bool {
        self.written >= self.payload.len()
    }

    #[cfg(test)]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Ordered sequence of messages awaiting transmission to one connection.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    messages: VecDeque<PendingMessage>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message at the tail.
    pub fn push(&mut self, message: PendingMessage) -> Result<(), TryReserveError> {
        self.messages.try_reserve(1)?;
        self.messages.push_back(message);
        Ok(())
    }

    /// The message currently being transmitted.
    pub fn front_mut(&mut self) -> Option<&mut PendingMessage> {
        self.messages.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<PendingMessage> {
        self.messages.pop_front()
    }

    /// Drop every queued message, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.messages.len();
        self.messages.clear();
        discarded
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Unwritten bytes across the whole queue.
    #[cfg(test)]
    pub fn pending_bytes(&self) -> usize {
        self.messages.iter().map(|m| m.remaining().len()).sum()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
        self.messages.iter()
    }
}
