//! Guest clipboard synchronization.
//!
//! A single active pipe connects the guest's clipboard service to the host.
//! Traffic in each direction is a little-endian u32 length followed by the
//! payload. The host-to-guest side is double buffered: data being written
//! right now lives in the in-progress slot and is never disturbed, while
//! host clipboard changes overwrite only the queued slot. This keeps the
//! guest consistent when the user copies new content mid-transfer: the
//! in-progress payload completes at its announced size, then the queued one
//! is offered.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hostpipe_logger::warn;
use hostpipe_pipe::{PipeContext, SendOutcome, SendResult, Service, ServicePipe};
use hostpipe_types::{
    CloseReason, OpenFlags, PollFlags, TransferError, TransferResult, WakeFlags,
};
use parking_lot::Mutex;

/// Upper bound for a clipboard payload announced by either side.
const MAX_CLIPBOARD_SIZE: usize = 64 << 20;

/// Invoked with the complete payload whenever the guest publishes its
/// clipboard.
pub type GuestClipboardCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// One directional transfer: the 4-byte size prefix, then the payload.
#[derive(Default)]
struct TransferState {
    buffer: Vec<u8>,
    size_acc: [u8; 4],
    data_size: u32,
    processed: usize,
    size_transferred: bool,
}

impl TransferState {
    fn reset(&mut self) {
        self.buffer.clear();
        self.size_acc = [0; 4];
        self.data_size = 0;
        self.processed = 0;
        self.size_transferred = false;
    }

    /// Nothing left to transfer in either phase.
    fn is_finished(&self) -> bool {
        self.size_transferred && self.processed == self.data_size as usize
    }

    /// Marks the state as already completed so it is skipped until new data
    /// is queued.
    fn mark_finished(&mut self) {
        self.reset();
        self.size_transferred = true;
    }

    fn fill(&mut self, data: &[u8]) {
        self.buffer = data.to_vec();
        self.data_size = data.len() as u32;
        // advance() re-derives the size from the accumulator when the size
        // phase completes, for both directions.
        self.size_acc = self.data_size.to_le_bytes();
        self.processed = 0;
        self.size_transferred = false;
    }

    /// Copies host data out to the guest vector. Stops early when the guest
    /// buffer is smaller than what is pending.
    fn write_to_guest(&mut self, bufs: &mut [&mut [u8]]) -> usize {
        let mut total = 0;
        for seg in bufs.iter_mut() {
            let mut offset = 0;
            while offset < seg.len() && !self.is_finished() {
                let n = if self.size_transferred {
                    let src = &self.buffer[self.processed..];
                    let n = src.len().min(seg.len() - offset);
                    seg[offset..offset + n].copy_from_slice(&src[..n]);
                    n
                } else {
                    let size_bytes = self.data_size.to_le_bytes();
                    let src = &size_bytes[self.processed..];
                    let n = src.len().min(seg.len() - offset);
                    seg[offset..offset + n].copy_from_slice(&src[..n]);
                    n
                };
                offset += n;
                total += n;
                self.advance(n);
            }
        }
        total
    }

    /// Copies guest data in. Returns `None` on an oversized announced
    /// length.
    fn read_from_guest(&mut self, bufs: &[&[u8]]) -> Option<usize> {
        let mut total = 0;
        for seg in bufs {
            let mut offset = 0;
            while offset < seg.len() && !self.is_finished() {
                if self.size_transferred {
                    let want = (self.data_size as usize - self.processed).min(seg.len() - offset);
                    self.buffer
                        .extend_from_slice(&seg[offset..offset + want]);
                    offset += want;
                    total += want;
                    self.advance(want);
                } else {
                    let want = (4 - self.processed).min(seg.len() - offset);
                    self.size_acc[self.processed..self.processed + want]
                        .copy_from_slice(&seg[offset..offset + want]);
                    offset += want;
                    total += want;
                    self.advance(want);
                    if self.size_transferred && self.data_size as usize > MAX_CLIPBOARD_SIZE {
                        return None;
                    }
                }
            }
        }
        Some(total)
    }

    fn advance(&mut self, n: usize) {
        self.processed += n;
        if !self.size_transferred && self.processed == 4 {
            // Size phase done, switch to the payload.
            self.size_transferred = true;
            self.processed = 0;
            self.data_size = u32::from_le_bytes(self.size_acc);
        }
    }
}

/// The host-to-guest side: the in-progress transfer plus the queued one.
struct WritingState {
    states: [TransferState; 2],
    in_progress: usize,
}

impl Default for WritingState {
    fn default() -> Self {
        let mut states = [TransferState::default(), TransferState::default()];
        states[0].mark_finished();
        states[1].mark_finished();
        WritingState {
            states,
            in_progress: 0,
        }
    }
}

impl WritingState {
    fn queue_contents(&mut self, data: &[u8]) {
        self.states[1 - self.in_progress].fill(data);
    }

    fn pick_state_with_data(&mut self) -> Option<&mut TransferState> {
        if !self.states[self.in_progress].is_finished() {
            return Some(&mut self.states[self.in_progress]);
        }
        let queued = 1 - self.in_progress;
        if !self.states[queued].is_finished() {
            self.in_progress = queued;
            return Some(&mut self.states[queued]);
        }
        None
    }

    fn clear_queued(&mut self) {
        self.states[1 - self.in_progress].mark_finished();
    }

    fn has_data(&self) -> bool {
        self.states.iter().any(|s| !s.is_finished())
    }
}

struct ActivePipe {
    ctx: PipeContext,
    wake_on_read: bool,
}

struct ClipboardShared {
    enabled: AtomicBool,
    callback: Mutex<Option<GuestClipboardCallback>>,
    writing: Mutex<WritingState>,
    active: Mutex<Option<ActivePipe>>,
}

/// The clipboard service; at most one pipe is active at a time.
pub struct ClipboardService {
    shared: Arc<ClipboardShared>,
}

impl Default for ClipboardService {
    fn default() -> Self {
        Self::new()
    }
}

impl ClipboardService {
    pub fn new() -> Self {
        ClipboardService {
            shared: Arc::new(ClipboardShared {
                enabled: AtomicBool::new(false),
                callback: Mutex::new(None),
                writing: Mutex::new(WritingState::default()),
                active: Mutex::new(None),
            }),
        }
    }

    /// Enables or disables clipboard sharing. While disabled, guest writes
    /// are swallowed and no data is offered for reading.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Installs the callback receiving complete guest clipboard payloads.
    pub fn set_guest_clipboard_callback(&self, callback: Option<GuestClipboardCallback>) {
        *self.shared.callback.lock() = callback;
    }

    /// Queues new host clipboard contents for the guest and wakes it if it
    /// asked to be woken for reads.
    pub fn set_guest_clipboard_contents(&self, data: &[u8]) {
        if !self.shared.enabled.load(Ordering::SeqCst) {
            return;
        }
        self.shared.writing.lock().queue_contents(data);
        self.shared.wake_guest_if_needed();
    }
}

impl ClipboardShared {
    fn wake_guest_if_needed(&self) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let mut active = self.active.lock();
        if let Some(pipe) = active.as_mut() {
            if pipe.wake_on_read && self.writing.lock().has_data() {
                pipe.wake_on_read = false;
                pipe.ctx.signal_wake(WakeFlags::READ);
            }
        }
    }
}

impl Service for ClipboardService {
    fn name(&self) -> &str {
        "clipboard"
    }

    fn create(
        &self,
        ctx: PipeContext,
        _flags: OpenFlags,
        _args: Option<&str>,
    ) -> Option<Box<dyn ServicePipe>> {
        let mut active = self.shared.active.lock();
        if active.is_some() {
            warn!("clipboard pipe already connected, refusing a second one");
            return None;
        }
        *active = Some(ActivePipe {
            ctx,
            wake_on_read: false,
        });
        Some(Box::new(ClipboardPipe {
            shared: Arc::clone(&self.shared),
            guest_read: TransferState::default(),
        }))
    }
}

struct ClipboardPipe {
    shared: Arc<ClipboardShared>,
    guest_read: TransferState,
}

impl ServicePipe for ClipboardPipe {
    fn on_guest_close(&mut self, _reason: CloseReason) {
        *self.shared.active.lock() = None;
    }

    fn on_guest_poll(&self) -> PollFlags {
        let mut flags = PollFlags::OUT;
        if self.shared.enabled.load(Ordering::SeqCst) && self.shared.writing.lock().has_data() {
            flags |= PollFlags::IN;
        }
        flags
    }

    fn on_guest_recv(&mut self, bufs: &mut [&mut [u8]]) -> TransferResult {
        let mut writing = self.shared.writing.lock();
        if !self.shared.enabled.load(Ordering::SeqCst) {
            // Do not start a new transfer, but let one already in progress
            // complete at its announced size.
            writing.clear_queued();
        }
        match writing.pick_state_with_data() {
            Some(state) => Ok(state.write_to_guest(bufs)),
            None => Err(TransferError::Again),
        }
    }

    fn on_guest_send(&mut self, bufs: &[&[u8]]) -> SendResult {
        if !self.shared.enabled.load(Ordering::SeqCst) {
            // Pretend the bytes were processed so the guest does not stall.
            return Ok(SendOutcome::Transferred(hostpipe_pipe::transfer::vector_len(bufs)));
        }
        let Some(total) = self.guest_read.read_from_guest(bufs) else {
            warn!("clipboard: guest announced an oversized payload, closing");
            return Err(TransferError::Io);
        };
        if self.guest_read.is_finished() {
            if let Some(callback) = self.shared.callback.lock().as_ref() {
                callback(&self.guest_read.buffer);
            }
            self.guest_read.reset();
        }
        Ok(SendOutcome::Transferred(total))
    }

    fn on_guest_want_wake_on(&mut self, flags: WakeFlags) {
        {
            let mut active = self.shared.active.lock();
            if let Some(pipe) = active.as_mut() {
                pipe.wake_on_read = flags.contains(WakeFlags::READ);
            }
        }
        self.shared.wake_guest_if_needed();
    }
}
