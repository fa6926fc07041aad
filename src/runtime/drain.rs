//! Drain handler: flush a connection's outbound queue into its stream.
//!
//! Messages are written head to tail. A short write advances the head
//! message's offset, so the next attempt resumes where the last one stopped.
//!
//! - would-block: the pass stops, the rest of the queue stays put and
//!   write-interest remains set
//! - hard error: the whole queue is discarded and write-interest cleared;
//!   whether the connection survives is up to the caller
//!   (see `WriteErrorPolicy`)

use crate::runtime::connection::{ConnectionRegistry, Handle};
use crate::runtime::error::RegistryError;
use std::io::{self, Write};

/// Result of one drain pass.
#[derive(Debug)]
pub enum DrainOutcome {
    /// Every queued message was written.
    Flushed { messages: usize, bytes: usize },
    /// The transport stopped accepting bytes. `remaining` messages are still queued.
    Blocked { bytes: usize, remaining: usize },
    /// A hard write error ended the pass and `discarded` messages were dropped.
    Failed { error: io::Error, discarded: usize },
}

impl<S: Write> ConnectionRegistry<S> {
    /// Write as much of `handle`'s queue as the stream accepts.
    pub fn drain(&mut self, handle: Handle) -> Result<DrainOutcome, RegistryError> {
        let conn = self.get_mut(handle).ok_or(RegistryError::NotFound(handle))?;
        let (stream, queue) = conn.parts_mut();

        let mut messages = 0;
        let mut bytes = 0;
        let mut failure = None;

        'queue: while let Some(message) = queue.front_mut() {
            while !message.is_complete() {
                match stream.write(message.remaining()) {
                    Ok(0) => {
                        failure = Some(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "stream accepted no bytes",
                        ));
                        break 'queue;
                    }
                    Ok(n) => {
                        message.advance(n);
                        bytes += n;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(DrainOutcome::Blocked {
                            bytes,
                            remaining: queue.len(),
                        });
                    }
                    Err(e) => {
                        failure = Some(e);
                        break 'queue;
                    }
                }
            }
            queue.pop_front();
            messages += 1;
        }

        let discarded = queue.clear();
        self.clear_write_interest(handle);

        Ok(match failure {
            Some(error) => DrainOutcome::Failed { error, discarded },
            None => DrainOutcome::Flushed { messages, bytes },
        })
    }
}
