//! The host-event capabilities handed to service pipes.

use std::sync::Weak;

use hostpipe_types::{CloseReason, PipeId, WakeFlags};

/// Sink for host-initiated pipe events, implemented by the pipe manager.
///
/// Implementations are callable from any thread: when the caller holds the
/// VM lock the event is delivered immediately, otherwise it is queued on the
/// deferred-operation queue and delivered when the device thread drains it.
pub trait PipeWaker: Send + Sync {
    /// Raises wake events for the pipe.
    fn signal_wake(&self, id: PipeId, flags: WakeFlags);

    /// Closes the pipe from the host side.
    fn close_from_host(&self, id: PipeId, reason: CloseReason);
}

/// Per-pipe handle a service uses to deliver host-initiated events.
///
/// Holds the pipe identifier and a non-owning reference to the manager, so a
/// clone captured by a worker thread stays safe to call after the pipe or
/// the whole manager is gone; such calls are silently discarded.
#[derive(Debug, Clone)]
pub struct PipeContext {
    id: PipeId,
    waker: Weak<dyn PipeWaker>,
}

impl PipeContext {
    /// Builds a context for the pipe `id`.
    pub fn new(id: PipeId, waker: Weak<dyn PipeWaker>) -> Self {
        PipeContext { id, waker }
    }

    /// The identifier of the pipe this context belongs to.
    pub fn id(&self) -> PipeId {
        self.id
    }

    /// Signals wake events to the guest. Callable from any thread.
    pub fn signal_wake(&self, flags: WakeFlags) {
        if let Some(waker) = self.waker.upgrade() {
            waker.signal_wake(self.id, flags);
        }
    }

    /// Asks the device to close the pipe. Callable from any thread.
    pub fn close_from_host(&self, reason: CloseReason) {
        if let Some(waker) = self.waker.upgrade() {
            waker.close_from_host(self.id, reason);
        }
    }
}
