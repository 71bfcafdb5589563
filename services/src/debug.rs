//! Write-only debug sink.

use std::io::{self, Write};
use std::sync::Arc;

use hostpipe_logger::warn;
use hostpipe_pipe::{PipeContext, SendOutcome, SendResult, Service, ServicePipe};
use hostpipe_types::stream::SnapshotReader;
use hostpipe_types::{CloseReason, OpenFlags, PollFlags, TransferError, TransferResult, WakeFlags};
use parking_lot::Mutex;

type Output = Arc<Mutex<Box<dyn Write + Send>>>;

/// Forwards everything the guest writes to a host-chosen stream; the guest
/// can never read back. With no output configured, bytes are counted and
/// dropped.
pub struct DebugSinkService {
    name: String,
    output: Option<Output>,
}

impl DebugSinkService {
    pub fn new(name: impl Into<String>, output: Option<Box<dyn Write + Send>>) -> Self {
        DebugSinkService {
            name: name.into(),
            output: output.map(|w| Arc::new(Mutex::new(w))),
        }
    }

    /// A sink writing to the emulator's stderr.
    pub fn with_stderr(name: impl Into<String>) -> Self {
        Self::new(name, Some(Box::new(io::stderr())))
    }
}

impl Service for DebugSinkService {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(
        &self,
        _ctx: PipeContext,
        _flags: OpenFlags,
        _args: Option<&str>,
    ) -> Option<Box<dyn ServicePipe>> {
        Some(Box::new(DebugSinkPipe {
            output: self.output.clone(),
        }))
    }

    // Claiming load support avoids force-closing the pipe on restore even
    // though there is no state to carry.
    fn can_load(&self) -> bool {
        true
    }

    fn load(
        &self,
        ctx: PipeContext,
        args: Option<&str>,
        _reader: &mut SnapshotReader<'_>,
    ) -> Option<Box<dyn ServicePipe>> {
        self.create(ctx, OpenFlags::empty(), args)
    }
}

struct DebugSinkPipe {
    output: Option<Output>,
}

impl ServicePipe for DebugSinkPipe {
    fn on_guest_close(&mut self, _reason: CloseReason) {}

    fn on_guest_poll(&self) -> PollFlags {
        PollFlags::OUT
    }

    fn on_guest_recv(&mut self, _bufs: &mut [&mut [u8]]) -> TransferResult {
        Err(TransferError::Io)
    }

    fn on_guest_send(&mut self, bufs: &[&[u8]]) -> SendResult {
        let mut total = 0;
        for buf in bufs {
            if let Some(output) = &self.output {
                if let Err(e) = output.lock().write_all(buf) {
                    warn!("debug sink write failed: {}", e);
                }
            }
            total += buf.len();
        }
        Ok(SendOutcome::Transferred(total))
    }

    fn on_guest_want_wake_on(&mut self, _flags: WakeFlags) {
        // Sends never return `again`, so there is nothing to wake for.
    }
}
