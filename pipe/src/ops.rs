//! The deferred-operation queue.
//!
//! Service threads, background workers and network callbacks that want to
//! deliver a wake or initiate a close without holding the VM lock enqueue
//! the operation here; the device thread drains it under the VM lock.
//! Ordering is preserved per pipe; nothing is guaranteed across pipes.

use std::collections::VecDeque;

use hostpipe_channel::{Receiver, Sender, bounded};
use hostpipe_types::{CloseReason, PipeId, WakeFlags};
use parking_lot::Mutex;

/// One queued host-initiated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredOp {
    /// Raise wake events on the pipe.
    Wake(WakeFlags),
    /// Close the pipe from the host side.
    CloseFromHost(CloseReason),
}

/// Process-wide queue of `(pipe, operation)` pairs.
///
/// Producers may be on any thread. A bounded ready channel lets the device
/// thread block on pending work without polling.
pub struct OpQueue {
    queue: Mutex<VecDeque<(PipeId, DeferredOp)>>,
    ready_tx: Sender<()>,
    ready_rx: Receiver<()>,
}

impl Default for OpQueue {
    fn default() -> Self {
        let (ready_tx, ready_rx) = bounded(1);
        OpQueue {
            queue: Mutex::new(VecDeque::new()),
            ready_tx,
            ready_rx,
        }
    }
}

impl OpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an operation for the pipe.
    pub fn push(&self, id: PipeId, op: DeferredOp) {
        self.queue.lock().push_back((id, op));
        // A full ready channel already means "work pending".
        let _ = self.ready_tx.try_send(());
    }

    /// Takes the oldest queued operation.
    pub fn pop(&self) -> Option<(PipeId, DeferredOp)> {
        self.queue.lock().pop_front()
    }

    /// Drops every queued operation for one pipe. Invoked as part of the
    /// closed transition so a destroyed endpoint is never woken.
    pub fn abort_pipe(&self, id: PipeId) {
        self.queue.lock().retain(|(pipe, _)| *pipe != id);
    }

    /// A receiver that becomes ready when operations are pending. The device
    /// thread may select on it.
    pub fn ready_receiver(&self) -> Receiver<()> {
        self.ready_rx.clone()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
