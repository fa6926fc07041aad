//! Cancellation token for the relay loop.
//!
//! The loop polls the token at the top of every cycle. Triggering it also
//! wakes a blocked readiness wait when a waker has been attached, so shutdown
//! does not have to wait for the poll timeout.

use mio::Waker;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::warn;

#[derive(Default)]
struct Inner {
    requested: AtomicBool,
    waker: OnceLock<Waker>,
}

/// Cloneable shutdown handle shared between the loop and whoever stops it.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake the loop if it is waiting.
    pub fn trigger(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        if let Some(waker) = self.inner.waker.get() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake relay loop");
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Attach the waker of the poll this token stops.
    ///
    /// Only the first waker sticks; returns false if one was already attached.
    pub(crate) fn attach(&self, waker: Waker) -> bool {
        self.inner.waker.set(waker).is_ok()
    }
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .field("waker", &self.inner.waker.get().is_some())
            .finish()
    }
}
