//! Reference-counted transport handles and the single-entry reuse cache.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::MultiplexedTransport;

struct SharedTransport {
    transport: Arc<dyn MultiplexedTransport>,
    closed: AtomicBool,
}

impl SharedTransport {
    fn close_once(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("closing proxy transport");
            self.transport.close();
        }
    }
}

impl Drop for SharedTransport {
    fn drop(&mut self) {
        self.close_once();
    }
}

/// One counted reference to a multiplexed transport.
///
/// Held by the reuse cache and by every stream opened on the transport. The
/// transport is closed exactly once, when the last lease is dropped.
#[derive(Clone)]
pub struct TransportLease(Arc<SharedTransport>);

impl TransportLease {
    pub fn new(transport: Arc<dyn MultiplexedTransport>) -> Self {
        Self(Arc::new(SharedTransport {
            transport,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn transport(&self) -> &Arc<dyn MultiplexedTransport> {
        &self.0.transport
    }

    /// Usable for a new CONNECT stream
    pub fn can_accept_new_stream(&self) -> bool {
        !self.is_closed() && self.0.transport.can_accept_new_stream()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// True when no cache entry or other stream shares the transport
    pub fn is_sole_owner(&self) -> bool {
        Arc::strong_count(&self.0) == 1
    }

    /// Number of live leases on the transport
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Close the transport now, regardless of other holders.
    pub(crate) fn force_close(&self) {
        self.0.close_once();
    }

    pub fn ptr_eq(&self, other: &TransportLease) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TransportLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLease")
            .field("holders", &self.holders())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Holds at most one reusable transport.
///
/// The lock is taken only to read or swap the handle, never across I/O.
#[derive(Default)]
pub struct ReuseCache {
    slot: Mutex<Option<TransportLease>>,
}

impl ReuseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a lease on the cached transport if it can open another stream.
    pub fn lookup(&self) -> Option<TransportLease> {
        let slot = self.slot.lock();
        slot.as_ref()
            .filter(|lease| lease.can_accept_new_stream())
            .cloned()
    }

    /// Cache `lease`, replacing any previous entry.
    pub fn install(&self, lease: TransportLease) {
        let previous = self.slot.lock().replace(lease);
        // Released outside the lock; may close the old transport
        drop(previous);
    }

    /// Drop the cached entry if it is still `lease`.
    pub fn evict_if(&self, lease: &TransportLease) -> bool {
        let evicted = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(current) if current.ptr_eq(lease) => slot.take(),
                _ => None,
            }
        };
        evicted.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }

    pub fn clear(&self) {
        let previous = self.slot.lock().take();
        drop(previous);
    }
}

impl fmt::Debug for ReuseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReuseCache")
            .field("cached", &!self.is_empty())
            .finish()
    }
}
