//! Broadcast fan-out.
//!
//! An inbound chunk is uppercased once and then copied into the outbound
//! queue of every other live connection. The sender never receives its own
//! message.

use crate::runtime::connection::{ConnectionRegistry, Handle};
use crate::runtime::error::RegistryError;
use crate::runtime::queue::PendingMessage;
use tracing::trace;

/// Map ASCII letters to uppercase; every other byte passes through unchanged.
pub fn shout(payload: &[u8]) -> Vec<u8> {
    payload.to_ascii_uppercase()
}

impl<S> ConnectionRegistry<S> {
    /// Queue an uppercased copy of `payload` for every connection except `origin`.
    ///
    /// Returns the number of recipients. On allocation failure the recipients
    /// already served keep their copy; nothing is rolled back.
    pub fn broadcast(&mut self, origin: Handle, payload: &[u8]) -> Result<usize, RegistryError> {
        let shouted = shout(payload);
        let recipients: Vec<Handle> = self.handles().filter(|&h| h != origin).collect();

        for &handle in &recipients {
            let alloc_err = |source| RegistryError::Allocation {
                handle,
                bytes: shouted.len(),
                source,
            };
            let message = PendingMessage::copy_from(&shouted).map_err(alloc_err)?;

            let Some(conn) = self.get_mut(handle) else {
                continue;
            };
            conn.queue_mut().push(message).map_err(alloc_err)?;
            self.set_write_interest(handle);
        }

        trace!(%origin, bytes = payload.len(), recipients = recipients.len(), "Broadcast queued");
        Ok(recipients.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shout_ascii_only() {
        assert_eq!(shout(b"hi"), b"HI");
        assert_eq!(shout(b"Hello, World 42!\n"), b"HELLO, WORLD 42!\n");
        assert_eq!(shout(b""), b"");

        let utf8 = "straße ünïcode".as_bytes();
        let expected = "STRAßE üNïCODE".as_bytes();
        assert_eq!(shout(utf8), expected);

        let raw = [0x00u8, 0x7f, 0x80, 0xe9, b'z'];
        assert_eq!(shout(&raw), [0x00, 0x7f, 0x80, 0xe9, b'Z']);
    }

    #[test]
    fn test_sender_excluded() {
        let mut registry = ConnectionRegistry::new(8);
        let a = registry.add(()).unwrap();
        let b = registry.add(()).unwrap();

        let recipients = registry.broadcast(a, b"hi").unwrap();
        assert_eq!(recipients, 1);
        assert_eq!(registry.queued(a), Some(0));
        assert_eq!(registry.queued(b), Some(1));

        let queued = registry.get(b).unwrap().queue().iter().next().unwrap();
        assert_eq!(&queued.payload()[..], b"HI");
        registry.assert_consistent();
    }

    #[test]
    fn test_fan_out_to_all_others() {
        let mut registry = ConnectionRegistry::new(8);
        let handles: Vec<Handle> = (0..5).map(|_| registry.add(()).unwrap()).collect();
        let origin = handles[2];

        let recipients = registry.broadcast(origin, b"ping").unwrap();
        assert_eq!(recipients, handles.len() - 1);

        for &handle in &handles {
            let expected = if handle == origin { 0 } else { 1 };
            assert_eq!(registry.queued(handle), Some(expected));
            assert_eq!(registry.wants_write(handle), handle != origin);
        }
        registry.assert_consistent();
    }

    #[test]
    fn test_messages_appended_in_order() {
        let mut registry = ConnectionRegistry::new(8);
        let a = registry.add(()).unwrap();
        let b = registry.add(()).unwrap();

        registry.broadcast(a, b"first").unwrap();
        registry.broadcast(a, b"second").unwrap();

        let payloads: Vec<&[u8]> = registry
            .get(b)
            .unwrap()
            .queue()
            .iter()
            .map(|m| &m.payload()[..])
            .collect();
        assert_eq!(payloads, vec![&b"FIRST"[..], &b"SECOND"[..]]);
    }

    #[test]
    fn test_lone_connection_gets_nothing() {
        let mut registry = ConnectionRegistry::new(8);
        let a = registry.add(()).unwrap();

        assert_eq!(registry.broadcast(a, b"echo?").unwrap(), 0);
        assert_eq!(registry.queued(a), Some(0));
        assert!(!registry.wants_write(a));
        assert!(registry.take_reregistrations().is_empty());
    }

    #[test]
    fn test_write_interest_flagged_for_reregister() {
        let mut registry = ConnectionRegistry::new(8);
        let a = registry.add(()).unwrap();
        let b = registry.add(()).unwrap();
        let c = registry.add(()).unwrap();

        registry.broadcast(b, b"x").unwrap();
        assert_eq!(registry.take_reregistrations(), vec![a, c]);

        // Already write-interested: no new registration needed.
        registry.broadcast(b, b"y").unwrap();
        assert!(registry.take_reregistrations().is_empty());
    }
}
