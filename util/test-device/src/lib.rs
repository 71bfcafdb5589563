//! A test version of the virtual pipe device.
//!
//! Usage:
//!
//! 1. Create a [`TestPipeDevice`]; it owns a fresh [`PipeManager`] wired to a
//!    process-local VM lock. Register services on `device.manager()`.
//! 2. For each guest client to simulate, call [`TestPipeDevice::open`] and
//!    connect the returned [`Guest`] to a named service, then drive it with
//!    `read`/`write`/`poll`.
//!
//! Guest operations take the VM lock for their duration, so the calling test
//! thread plays the role of the device thread. Deferred operations queued by
//! worker threads are delivered by [`TestPipeDevice::pump`], which the
//! blocking read helpers invoke while they wait.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use hostpipe_manager::PipeManager;
use hostpipe_pipe::HwPipe;
use hostpipe_types::stream::{SnapshotReader, SnapshotWriter};
use hostpipe_types::{CloseReason, OpenFlags, PIPE_ERROR_AGAIN, PipeId, PollFlags, WakeFlags};
use hostpipe_vm_lock::{HostVmLock, ScopedVmLock, VmLock};
use parking_lot::Mutex;

/// How long the blocking helpers wait for asynchronous traffic.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Hardware-side endpoint recording everything the core tells the device.
#[derive(Default)]
pub struct TestHwPipe {
    id: OnceLock<PipeId>,
    pending_wakes: Mutex<WakeFlags>,
    wake_log: Mutex<Vec<WakeFlags>>,
    closed_from_host: AtomicBool,
    rebinds: AtomicUsize,
    wake_callback: Mutex<Option<Box<dyn Fn(WakeFlags) + Send>>>,
}

impl TestHwPipe {
    /// Accumulated wake flags since the last call, cleared on read.
    pub fn take_wakes(&self) -> WakeFlags {
        std::mem::take(&mut *self.pending_wakes.lock())
    }

    /// Every wake signaled so far, in order.
    pub fn wake_log(&self) -> Vec<WakeFlags> {
        self.wake_log.lock().clone()
    }

    /// Whether the host asked the device to hang up.
    pub fn is_closed_from_host(&self) -> bool {
        self.closed_from_host.load(Ordering::SeqCst)
    }

    /// Number of rebind notifications received.
    pub fn rebind_count(&self) -> usize {
        self.rebinds.load(Ordering::SeqCst)
    }

    /// Installs a callback invoked on every wake, under the VM lock.
    pub fn set_wake_callback(&self, callback: impl Fn(WakeFlags) + Send + 'static) {
        *self.wake_callback.lock() = Some(Box::new(callback));
    }
}

impl HwPipe for TestHwPipe {
    fn close_from_host(&self) {
        self.closed_from_host.store(true, Ordering::SeqCst);
    }

    fn signal_wake(&self, flags: WakeFlags) {
        *self.pending_wakes.lock() |= flags;
        self.wake_log.lock().push(flags);
        if let Some(callback) = self.wake_callback.lock().as_ref() {
            callback(flags);
        }
    }

    fn id(&self) -> PipeId {
        self.id.get().copied().unwrap_or(PipeId::new(0))
    }

    fn rebind_notify(&self) {
        self.rebinds.fetch_add(1, Ordering::SeqCst);
    }
}

/// The test virtual device: a manager plus the VM lock that gates it.
pub struct TestPipeDevice {
    manager: Arc<PipeManager>,
    vm_lock: Arc<HostVmLock>,
}

impl Default for TestPipeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl TestPipeDevice {
    pub fn new() -> Self {
        let manager = PipeManager::new();
        let vm_lock = Arc::new(HostVmLock::new());
        manager
            .init_threading(Arc::clone(&vm_lock) as Arc<dyn VmLock>)
            .expect("fresh manager accepts init_threading");
        TestPipeDevice { manager, vm_lock }
    }

    /// The manager under test; register services here.
    pub fn manager(&self) -> &Arc<PipeManager> {
        &self.manager
    }

    /// Takes the VM lock, making the calling thread the device thread.
    pub fn lock(&self) -> ScopedVmLock<'_> {
        ScopedVmLock::new(&*self.vm_lock)
    }

    /// Drains the deferred-operation queue on this thread.
    pub fn pump(&self) -> usize {
        let _guard = self.lock();
        self.manager.process_deferred_operations()
    }

    /// Opens a pipe in connector state.
    pub fn open(&self) -> Guest {
        self.open_with_flags(OpenFlags::empty())
    }

    /// Opens a pipe with transport flags.
    pub fn open_with_flags(&self, flags: OpenFlags) -> Guest {
        let hw = Arc::new(TestHwPipe::default());
        let hw_dyn: Arc<dyn HwPipe> = hw.clone();
        let weak: Weak<dyn HwPipe> = Arc::downgrade(&hw_dyn);
        let id = {
            let _guard = self.lock();
            self.manager
                .guest_open_with_flags(weak, flags)
                .expect("guest_open on an initialized manager")
        };
        let _ = hw.id.set(id);
        Guest {
            manager: Arc::clone(&self.manager),
            vm_lock: Arc::clone(&self.vm_lock),
            hw,
            id,
            closed: Cell::new(false),
        }
    }

    /// Opens a pipe and connects it to `name`, returning the guest on
    /// success.
    pub fn connect(&self, name: &str) -> Option<Guest> {
        let guest = self.open();
        if guest.connect(name) == 0 { Some(guest) } else { None }
    }

    /// Saves the whole live-pipe set, including the pre/post hooks.
    pub fn snapshot_save(&self) -> io::Result<Vec<u8>> {
        let _guard = self.lock();
        let mut snapshot = Vec::new();
        let mut writer = SnapshotWriter::new(&mut snapshot);
        self.manager.guest_pre_save(&mut writer)?;
        self.manager.guest_save(&mut writer)?;
        self.manager.guest_post_save(&mut writer)?;
        Ok(snapshot)
    }

    /// Mirror of [`TestPipeDevice::snapshot_save`]; recreates one hardware
    /// endpoint per restored pipe and returns the guests.
    pub fn snapshot_load(&self, snapshot: &[u8]) -> io::Result<Vec<Guest>> {
        let _guard = self.lock();
        let mut cursor: &[u8] = snapshot;
        let mut reader = SnapshotReader::new(&mut cursor);
        self.manager.guest_pre_load(&mut reader)?;
        let mut hw_pipes: Vec<Arc<TestHwPipe>> = Vec::new();
        let loaded = self.manager.guest_load(&mut reader, &mut |id| {
            let hw = Arc::new(TestHwPipe::default());
            let _ = hw.id.set(id);
            let hw_dyn: Arc<dyn HwPipe> = hw.clone();
            let weak: Weak<dyn HwPipe> = Arc::downgrade(&hw_dyn);
            hw_pipes.push(hw);
            weak
        })?;
        self.manager.guest_post_load(&mut reader)?;
        Ok(loaded
            .into_iter()
            .zip(hw_pipes)
            .map(|(id, hw)| Guest {
                manager: Arc::clone(&self.manager),
                vm_lock: Arc::clone(&self.vm_lock),
                hw,
                id,
                closed: Cell::new(false),
            })
            .collect())
    }
}

/// One simulated guest client.
pub struct Guest {
    manager: Arc<PipeManager>,
    vm_lock: Arc<HostVmLock>,
    hw: Arc<TestHwPipe>,
    id: PipeId,
    closed: Cell<bool>,
}

impl Guest {
    /// The pipe identifier.
    pub fn id(&self) -> PipeId {
        self.id
    }

    /// The hardware endpoint, for inspecting wakes and host closes.
    pub fn hw(&self) -> &Arc<TestHwPipe> {
        &self.hw
    }

    /// Writes `pipe:<name>` plus the terminating NUL. Returns 0 on success
    /// and a negative status when the connection was refused.
    pub fn connect(&self, name: &str) -> i32 {
        let mut request = format!("pipe:{}", name).into_bytes();
        request.push(0);
        let sent = self.write(&request);
        if sent < 0 {
            return sent;
        }
        if sent as usize != request.len() || self.poll().contains(PollFlags::HUP) {
            return -1;
        }
        0
    }

    /// Single send of one buffer. Returns the raw status.
    pub fn write(&self, data: &[u8]) -> i32 {
        self.write_vec(&[data])
    }

    /// Single send of a scatter/gather vector.
    pub fn write_vec(&self, bufs: &[&[u8]]) -> i32 {
        let _guard = ScopedVmLock::new(&*self.vm_lock);
        self.manager.guest_send(self.id, bufs)
    }

    /// Single receive into one buffer. Returns the raw status.
    pub fn read(&self, buf: &mut [u8]) -> i32 {
        self.read_vec(&mut [buf])
    }

    /// Single receive into a scatter/gather vector.
    pub fn read_vec(&self, bufs: &mut [&mut [u8]]) -> i32 {
        let _guard = ScopedVmLock::new(&*self.vm_lock);
        self.manager.guest_recv(self.id, bufs)
    }

    pub fn poll(&self) -> PollFlags {
        let _guard = ScopedVmLock::new(&*self.vm_lock);
        self.manager.guest_poll(self.id)
    }

    pub fn wake_on(&self, flags: WakeFlags) {
        let _guard = ScopedVmLock::new(&*self.vm_lock);
        self.manager.guest_wake_on(self.id, flags);
    }

    /// Closes the guest side.
    pub fn close(&self) {
        if !self.closed.replace(true) {
            let _guard = ScopedVmLock::new(&*self.vm_lock);
            self.manager.guest_close(self.id, CloseReason::Graceful);
        }
    }

    /// Writes the whole buffer, retrying partial transfers and pumping the
    /// deferred queue while the service reports `again`.
    pub fn write_all(&self, data: &[u8]) -> bool {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        let mut offset = 0;
        while offset < data.len() {
            let status = self.write(&data[offset..]);
            if status > 0 {
                offset += status as usize;
            } else if status == PIPE_ERROR_AGAIN {
                if Instant::now() >= deadline {
                    return false;
                }
                self.pump_once();
            } else {
                return false;
            }
        }
        true
    }

    /// Reads exactly `buf.len()` bytes, pumping the deferred queue while
    /// waiting for asynchronous producers.
    pub fn read_exact(&self, buf: &mut [u8]) -> bool {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        let mut offset = 0;
        while offset < buf.len() {
            let status = self.read(&mut buf[offset..]);
            if status > 0 {
                offset += status as usize;
            } else if status == PIPE_ERROR_AGAIN {
                if Instant::now() >= deadline {
                    return false;
                }
                self.pump_once();
            } else {
                return false;
            }
        }
        true
    }

    /// Writes one length-prefixed message.
    pub fn write_message(&self, payload: &[u8]) -> bool {
        let prefix = (payload.len() as u32).to_le_bytes();
        self.write_all(&prefix) && (payload.is_empty() || self.write_all(payload))
    }

    /// Reads one length-prefixed message.
    pub fn read_message(&self) -> Option<Vec<u8>> {
        let mut prefix = [0u8; 4];
        if !self.read_exact(&mut prefix) {
            return None;
        }
        let len = u32::from_le_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        if len > 0 && !self.read_exact(&mut payload) {
            return None;
        }
        Some(payload)
    }

    fn pump_once(&self) {
        {
            let _guard = ScopedVmLock::new(&*self.vm_lock);
            self.manager.process_deferred_operations();
        }
        thread::sleep(Duration::from_millis(1));
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        self.close();
    }
}
