use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hostpipe_channel::Receiver;
use hostpipe_error::{Error, Result};
use hostpipe_logger::{debug, error, warn};
use hostpipe_pipe::{
    ConnectorProgress, DeferredOp, HostEndpoint, HwPipe, OpQueue, PipeContext, PipeWaker,
    SendOutcome, Service, ServiceRegistry, ServicePipe, transfer,
};
use hostpipe_types::{
    CloseReason, OpenFlags, PIPE_ERROR_INVAL, PipeId, PollFlags, TransferError, WakeFlags,
    raw_transfer_result,
};
use hostpipe_vm_lock::VmLock;
use parking_lot::{Mutex, RwLock};

pub(crate) struct EntryState {
    pub(crate) state: HostEndpoint,
    pub(crate) service: Option<Arc<dyn Service>>,
    pub(crate) args: Option<String>,
}

#[derive(Clone)]
pub(crate) struct PipeSlot {
    pub(crate) hw: Weak<dyn HwPipe>,
    pub(crate) flags: OpenFlags,
    pub(crate) entry: Arc<Mutex<EntryState>>,
}

/// Owns all live pipes and the service registry.
///
/// An explicit owned value; the embedding emulator context holds one
/// `Arc<PipeManager>` and threads it to the virtual device and to service
/// registration code.
pub struct PipeManager {
    registry: ServiceRegistry,
    pipes: Mutex<BTreeMap<PipeId, PipeSlot>>,
    next_id: AtomicU64,
    vm_lock: RwLock<Option<Arc<dyn VmLock>>>,
    ops: OpQueue,
    self_ref: Weak<PipeManager>,
}

impl PipeManager {
    /// Creates an empty manager. Services must be registered and
    /// `init_threading` called before the first guest open.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| PipeManager {
            registry: ServiceRegistry::new(),
            pipes: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            vm_lock: RwLock::new(None),
            ops: OpQueue::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Captures the VM-lock instance used to answer "does this thread hold
    /// the VM lock?". Must be called exactly once before any guest pipe is
    /// opened.
    pub fn init_threading(&self, vm_lock: Arc<dyn VmLock>) -> Result<()> {
        let mut slot = self.vm_lock.write();
        if slot.is_some() {
            return Err(Error::ThreadingAlreadyInitialized);
        }
        *slot = Some(vm_lock);
        Ok(())
    }

    /// The service registry of this manager.
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Registers a service factory. Convenience wrapper over
    /// `registry().register`.
    pub fn register_service(&self, service: Arc<dyn Service>) -> Result<()> {
        self.registry.register(service).map_err(Error::from)
    }

    /// Closes every pipe, drops queued operations and clears the registry.
    /// Test hook preserved from the original service manager.
    pub fn reset_all(&self) {
        let slots = mem::take(&mut *self.pipes.lock());
        for (id, slot) in slots {
            self.ops.abort_pipe(id);
            slot.entry.lock().state.close(CloseReason::Reboot);
        }
        while self.ops.pop().is_some() {}
        self.registry.reset_all();
    }

    /// Number of live pipes, closed-but-unacknowledged ones included.
    pub fn live_pipe_count(&self) -> usize {
        self.pipes.lock().len()
    }

    /// Resolves the hardware endpoint of a live pipe.
    pub fn hw_endpoint(&self, id: PipeId) -> Option<Arc<dyn HwPipe>> {
        self.slot(id).and_then(|slot| slot.hw.upgrade())
    }

    /// A receiver that becomes ready when deferred operations are pending;
    /// the device thread may select on it and then call
    /// [`PipeManager::process_deferred_operations`].
    pub fn deferred_ready_receiver(&self) -> Receiver<()> {
        self.ops.ready_receiver()
    }

    // -- device entry points -------------------------------------------------

    /// Opens a new pipe in connector state and returns its identifier.
    pub fn guest_open(&self, hw: Weak<dyn HwPipe>) -> Result<PipeId> {
        self.guest_open_with_flags(hw, OpenFlags::empty())
    }

    /// `guest_open` with transport properties reported by the device.
    pub fn guest_open_with_flags(&self, hw: Weak<dyn HwPipe>, flags: OpenFlags) -> Result<PipeId> {
        if self.vm_lock.read().is_none() {
            return Err(Error::ThreadingNotInitialized);
        }
        self.assert_device_thread("guest_open");
        self.registry.freeze();
        let id = PipeId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = PipeSlot {
            hw,
            flags,
            entry: Arc::new(Mutex::new(EntryState {
                state: HostEndpoint::new_connector(),
                service: None,
                args: None,
            })),
        };
        self.pipes.lock().insert(id, slot);
        debug!("pipe {} opened (flags {:?})", id, flags);
        Ok(id)
    }

    /// The guest closed the pipe; destroys the host endpoint.
    pub fn guest_close(&self, id: PipeId, reason: CloseReason) {
        self.assert_device_thread("guest_close");
        let Some(slot) = self.pipes.lock().remove(&id) else {
            warn!("guest_close on unknown pipe {}", id);
            return;
        };
        self.ops.abort_pipe(id);
        slot.entry.lock().state.close(reason);
        debug!("pipe {} closed ({})", id, reason);
    }

    /// Polls the pipe state for the guest.
    pub fn guest_poll(&self, id: PipeId) -> PollFlags {
        self.assert_device_thread("guest_poll");
        match self.slot(id) {
            Some(slot) => slot.entry.lock().state.poll(),
            None => PollFlags::HUP,
        }
    }

    /// Moves service data into the guest's buffer vector.
    pub fn guest_recv(&self, id: PipeId, bufs: &mut [&mut [u8]]) -> i32 {
        self.assert_device_thread("guest_recv");
        if transfer::vector_len_mut(bufs) == 0 {
            return 0;
        }
        let Some(slot) = self.slot(id) else {
            return PIPE_ERROR_INVAL;
        };
        raw_transfer_result(slot.entry.lock().state.recv(bufs))
    }

    /// Moves the guest's buffer vector into the host endpoint. In connector
    /// state this accumulates the service name and performs the bind.
    pub fn guest_send(&self, id: PipeId, bufs: &[&[u8]]) -> i32 {
        self.assert_device_thread("guest_send");
        if transfer::vector_len(bufs) == 0 {
            return 0;
        }
        let Some(slot) = self.slot(id) else {
            return PIPE_ERROR_INVAL;
        };
        let mut entry = slot.entry.lock();

        let progress = match &mut entry.state {
            HostEndpoint::Connector(connector) => Some(connector.feed(bufs)),
            _ => None,
        };
        if let Some(progress) = progress {
            return self.advance_connector(id, &slot, &mut *entry, progress);
        }

        let result = match &mut entry.state {
            HostEndpoint::Bound(pipe) => pipe.on_guest_send(bufs),
            HostEndpoint::Closed(_) => return TransferError::Closed.raw(),
            HostEndpoint::Connector(_) => unreachable!("connector handled above"),
        };
        match result {
            Ok(SendOutcome::Transferred(n)) => n as i32,
            Ok(SendOutcome::Rebound {
                transferred,
                replacement,
            }) => {
                debug!("pipe {} rebound by service", id);
                entry.state.bind(replacement);
                transferred as i32
            }
            Err(e) => e.raw(),
        }
    }

    /// Records the events the guest wants to be woken for.
    pub fn guest_wake_on(&self, id: PipeId, flags: WakeFlags) {
        self.assert_device_thread("guest_wake_on");
        if let Some(slot) = self.slot(id) {
            slot.entry.lock().state.want_wake_on(flags);
        }
    }

    /// Executes queued host-initiated operations on the device thread.
    /// Returns the number of operations executed.
    pub fn process_deferred_operations(&self) -> usize {
        self.assert_device_thread("process_deferred_operations");
        // Operations re-queued while draining wait for the next drain.
        let pending = self.ops.len();
        let mut executed = 0;
        for _ in 0..pending {
            let Some((id, op)) = self.ops.pop() else {
                break;
            };
            self.execute_op(id, op);
            executed += 1;
        }
        executed
    }

    // -- internals -----------------------------------------------------------

    fn advance_connector(
        &self,
        id: PipeId,
        slot: &PipeSlot,
        entry: &mut EntryState,
        progress: ConnectorProgress,
    ) -> i32 {
        match progress {
            ConnectorProgress::Pending { consumed } => consumed as i32,
            ConnectorProgress::Rejected => {
                warn!("pipe {}: malformed connect request", id);
                self.hang_up(id, slot, entry, CloseReason::Error);
                PIPE_ERROR_INVAL
            }
            ConnectorProgress::Connect {
                request,
                consumed,
                trailing,
            } => {
                let Some(service) = self.registry.lookup(&request.name) else {
                    warn!("pipe {}: unknown service {}", id, request.name);
                    self.hang_up(id, slot, entry, CloseReason::Error);
                    return consumed as i32;
                };
                let ctx = self.pipe_context(id);
                let Some(pipe) = service.create(ctx, slot.flags, request.args.as_deref()) else {
                    warn!("pipe {}: service {} refused connection", id, request.name);
                    self.hang_up(id, slot, entry, CloseReason::Error);
                    return consumed as i32;
                };
                debug!("pipe {} bound to service {}", id, request.name);
                entry.state.bind(pipe);
                entry.service = Some(service);
                entry.args = request.args;
                if slot.flags.contains(OpenFlags::VIRTIO) {
                    if let Some(hw) = slot.hw.upgrade() {
                        hw.rebind_notify();
                    }
                }
                let mut total = consumed;
                if !trailing.is_empty() {
                    total += self.deliver_trailing(id, entry, &trailing);
                }
                total as i32
            }
        }
    }

    /// Hands the bytes written after the NUL to the freshly bound pipe,
    /// atomically with the transition. Bytes the service does not accept are
    /// reported unconsumed so the guest retries them.
    fn deliver_trailing(&self, id: PipeId, entry: &mut EntryState, trailing: &[u8]) -> usize {
        let result = match &mut entry.state {
            HostEndpoint::Bound(pipe) => pipe.on_guest_send(&[trailing]),
            _ => return 0,
        };
        match result {
            Ok(SendOutcome::Transferred(n)) => n,
            Ok(SendOutcome::Rebound {
                transferred,
                replacement,
            }) => {
                entry.state.bind(replacement);
                transferred
            }
            Err(_) => 0,
        }
    }

    /// Transitions an entry to closed and tells the device to hang up.
    fn hang_up(&self, id: PipeId, slot: &PipeSlot, entry: &mut EntryState, reason: CloseReason) {
        entry.state.close(reason);
        entry.service = None;
        self.ops.abort_pipe(id);
        if let Some(hw) = slot.hw.upgrade() {
            hw.close_from_host();
        }
    }

    pub(crate) fn slot(&self, id: PipeId) -> Option<PipeSlot> {
        self.pipes.lock().get(&id).cloned()
    }

    pub(crate) fn all_slots(&self) -> Vec<(PipeId, PipeSlot)> {
        self.pipes
            .lock()
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect()
    }

    pub(crate) fn insert_slot(&self, id: PipeId, slot: PipeSlot) {
        self.next_id.fetch_max(id.value() + 1, Ordering::Relaxed);
        self.pipes.lock().insert(id, slot);
    }

    pub(crate) fn push_deferred(&self, id: PipeId, op: DeferredOp) {
        self.ops.push(id, op);
    }

    pub(crate) fn pipe_context(&self, id: PipeId) -> PipeContext {
        let waker: Weak<dyn PipeWaker> = self.self_ref.clone();
        PipeContext::new(id, waker)
    }

    pub(crate) fn require_threading(&self) -> Result<()> {
        if self.vm_lock.read().is_none() {
            return Err(Error::ThreadingNotInitialized);
        }
        Ok(())
    }

    pub(crate) fn bind_loaded(
        &self,
        id: PipeId,
        hw: Weak<dyn HwPipe>,
        flags: OpenFlags,
        pipe: Box<dyn ServicePipe>,
        service: Arc<dyn Service>,
        args: Option<String>,
    ) {
        self.insert_slot(id, PipeSlot {
            hw,
            flags,
            entry: Arc::new(Mutex::new(EntryState {
                state: HostEndpoint::Bound(pipe),
                service: Some(service),
                args,
            })),
        });
    }

    /// Inserts a pipe that could not be restored; the guest observes hangup
    /// at its next poll and the device is told through the deferred queue.
    pub(crate) fn insert_force_closed(&self, id: PipeId, hw: Weak<dyn HwPipe>) {
        self.insert_slot(id, PipeSlot {
            hw,
            flags: OpenFlags::empty(),
            entry: Arc::new(Mutex::new(EntryState {
                state: HostEndpoint::Closed(CloseReason::LoadSnapshot),
                service: None,
                args: None,
            })),
        });
        self.push_deferred(id, DeferredOp::CloseFromHost(CloseReason::LoadSnapshot));
    }

    fn holds_vm_lock(&self) -> bool {
        self.vm_lock
            .read()
            .as_ref()
            .map(|lock| lock.is_locked_by_self())
            .unwrap_or(false)
    }

    fn assert_device_thread(&self, operation: &str) {
        if !self.holds_vm_lock() {
            error!("{} called without holding the VM lock", operation);
            debug_assert!(false, "{} requires the VM lock", operation);
        }
    }

    fn execute_op(&self, id: PipeId, op: DeferredOp) {
        // The pipe may be gone by the time the device thread gets here;
        // discard silently.
        let Some(slot) = self.slot(id) else {
            return;
        };
        match op {
            DeferredOp::Wake(flags) => {
                // The entry is only held across a guest operation on this
                // very pipe, in which case it is certainly not closed.
                let closed = slot
                    .entry
                    .try_lock()
                    .map(|entry| entry.state.is_closed())
                    .unwrap_or(false);
                if closed {
                    return;
                }
                if let Some(hw) = slot.hw.upgrade() {
                    hw.signal_wake(flags);
                }
            }
            DeferredOp::CloseFromHost(reason) => {
                match slot.entry.try_lock() {
                    Some(mut entry) => {
                        if !entry.state.is_closed() {
                            entry.state.close(reason);
                            entry.service = None;
                        }
                    }
                    None => {
                        // Mid-operation on this pipe; retry on the next
                        // deferred drain.
                        self.ops.push(id, op);
                        return;
                    }
                }
                self.ops.abort_pipe(id);
                if let Some(hw) = slot.hw.upgrade() {
                    hw.close_from_host();
                }
            }
        }
    }
}

impl PipeWaker for PipeManager {
    fn signal_wake(&self, id: PipeId, flags: WakeFlags) {
        if self.holds_vm_lock() {
            self.execute_op(id, DeferredOp::Wake(flags));
        } else {
            self.ops.push(id, DeferredOp::Wake(flags));
        }
    }

    fn close_from_host(&self, id: PipeId, reason: CloseReason) {
        if self.holds_vm_lock() {
            self.execute_op(id, DeferredOp::CloseFromHost(reason));
        } else {
            self.ops.push(id, DeferredOp::CloseFromHost(reason));
        }
    }
}

impl Drop for PipeManager {
    fn drop(&mut self) {
        // Manager shutdown destroys every pipe unconditionally.
        let slots = mem::take(self.pipes.get_mut());
        for (_, slot) in slots {
            slot.entry.lock().state.close(CloseReason::Reboot);
        }
    }
}
