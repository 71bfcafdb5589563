//! Process-lifetime tracker.
//!
//! A guest process opens one of these pipes before acquiring host resources.
//! The pipe hands the guest a unique 64-bit process id; when the process
//! dies for any reason its pipe closes, which is the signal to run the
//! registered cleanup callback for that id.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hostpipe_logger::warn;
use hostpipe_pipe::{PipeContext, SendOutcome, SendResult, Service, ServicePipe, transfer};
use hostpipe_types::stream::{SnapshotReader, SnapshotWriter};
use hostpipe_types::{
    CloseReason, OpenFlags, PollFlags, TransferError, TransferResult, WakeFlags,
};
use parking_lot::Mutex;

/// The confirm code a guest writes before asking for its id.
const CONFIRM_CODE: i32 = 100;

type CleanupCallback = Box<dyn Fn(u64) + Send + Sync>;

struct TrackerShared {
    head_id: AtomicU64,
    ids: Mutex<HashSet<u64>>,
    cleanup: Mutex<Option<CleanupCallback>>,
}

/// Allocates a monotonically increasing process id per guest open and runs
/// the cleanup callback when the guest side closes.
pub struct ProcessTrackerService {
    shared: Arc<TrackerShared>,
}

impl Default for ProcessTrackerService {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTrackerService {
    pub fn new() -> Self {
        ProcessTrackerService {
            shared: Arc::new(TrackerShared {
                head_id: AtomicU64::new(0),
                ids: Mutex::new(HashSet::new()),
                cleanup: Mutex::new(None),
            }),
        }
    }

    /// Installs the callback invoked with the process id of every closed
    /// pipe.
    pub fn set_cleanup_callback(&self, callback: impl Fn(u64) + Send + Sync + 'static) {
        *self.shared.cleanup.lock() = Some(Box::new(callback));
    }

    /// Visits every live process id.
    pub fn for_each_process_id(&self, mut f: impl FnMut(u64)) {
        for id in self.shared.ids.lock().iter() {
            f(*id);
        }
    }

    pub fn live_process_count(&self) -> usize {
        self.shared.ids.lock().len()
    }

    fn track(&self, unique_id: u64) -> ProcessTrackerPipe {
        self.shared.ids.lock().insert(unique_id);
        ProcessTrackerPipe {
            shared: Arc::clone(&self.shared),
            unique_id,
            has_data: false,
        }
    }
}

impl Service for ProcessTrackerService {
    fn name(&self) -> &str {
        "process-tracker"
    }

    fn create(
        &self,
        ctx: PipeContext,
        flags: OpenFlags,
        _args: Option<&str>,
    ) -> Option<Box<dyn ServicePipe>> {
        // Virtio transports key the process id off the hardware endpoint
        // identifier; everything else draws from the sequential id space.
        let unique_id = if flags.contains(OpenFlags::VIRTIO) {
            let id = ctx.id().value();
            self.shared.head_id.store(id, Ordering::SeqCst);
            id
        } else {
            self.shared.head_id.fetch_add(1, Ordering::SeqCst) + 1
        };
        Some(Box::new(self.track(unique_id)))
    }

    fn can_load(&self) -> bool {
        true
    }

    fn load(
        &self,
        _ctx: PipeContext,
        _args: Option<&str>,
        reader: &mut SnapshotReader<'_>,
    ) -> Option<Box<dyn ServicePipe>> {
        let unique_id = reader.get_be64().ok()?;
        let has_data = reader.get_byte().ok()? != 0;
        let mut pipe = self.track(unique_id);
        pipe.has_data = has_data;
        Some(Box::new(pipe))
    }

    fn pre_save(&self, writer: &mut SnapshotWriter<'_>) -> io::Result<()> {
        writer.put_be64(self.shared.head_id.load(Ordering::SeqCst))
    }

    fn pre_load(&self, reader: &mut SnapshotReader<'_>) -> io::Result<()> {
        self.shared
            .head_id
            .store(reader.get_be64()?, Ordering::SeqCst);
        Ok(())
    }
}

struct ProcessTrackerPipe {
    shared: Arc<TrackerShared>,
    unique_id: u64,
    has_data: bool,
}

impl ServicePipe for ProcessTrackerPipe {
    fn on_guest_close(&mut self, _reason: CloseReason) {
        if self.shared.ids.lock().remove(&self.unique_id) {
            if let Some(cleanup) = self.shared.cleanup.lock().as_ref() {
                cleanup(self.unique_id);
            }
        }
    }

    fn on_guest_poll(&self) -> PollFlags {
        PollFlags::IN | PollFlags::OUT
    }

    fn on_guest_recv(&mut self, bufs: &mut [&mut [u8]]) -> TransferResult {
        if !self.has_data {
            return Ok(0);
        }
        let id_bytes = self.unique_id.to_le_bytes();
        if transfer::vector_len_mut(bufs) < id_bytes.len() {
            return Err(TransferError::Invalid);
        }
        self.has_data = false;
        Ok(transfer::scatter(&id_bytes, bufs))
    }

    fn on_guest_send(&mut self, bufs: &[&[u8]]) -> SendResult {
        let incoming = transfer::gather(bufs);
        if incoming.len() < 4 {
            return Err(TransferError::Invalid);
        }
        let code = i32::from_le_bytes(incoming[..4].try_into().expect("four bytes checked"));
        if code != CONFIRM_CODE {
            warn!(
                "process tracker {}: unexpected confirm code {}",
                self.unique_id, code
            );
            return Err(TransferError::Invalid);
        }
        self.has_data = true;
        Ok(SendOutcome::Transferred(incoming.len()))
    }

    fn on_guest_want_wake_on(&mut self, _flags: WakeFlags) {}

    fn on_save(&self, writer: &mut SnapshotWriter<'_>) -> io::Result<()> {
        writer.put_be64(self.unique_id)?;
        writer.put_byte(self.has_data as u8)
    }
}

impl Drop for ProcessTrackerPipe {
    fn drop(&mut self) {
        self.shared.ids.lock().remove(&self.unique_id);
    }
}
