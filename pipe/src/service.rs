//! The service-pipe contract and the service factory trait.

use std::io;

use hostpipe_types::stream::{SnapshotReader, SnapshotWriter};
use hostpipe_types::{CloseReason, OpenFlags, PollFlags, TransferResult, WakeFlags};

use crate::context::PipeContext;

/// Result of a successful guest send.
pub enum SendOutcome {
    /// Bytes were moved into the service.
    Transferred(usize),
    /// A one-shot protocol handler consumed the bytes and hands the caller a
    /// replacement host endpoint; the manager rebinds the pipe to
    /// `replacement` before the next guest operation.
    Rebound {
        transferred: usize,
        replacement: Box<dyn ServicePipe>,
    },
}

impl std::fmt::Debug for SendOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendOutcome::Transferred(n) => f.debug_tuple("Transferred").field(n).finish(),
            SendOutcome::Rebound { transferred, .. } => f
                .debug_struct("Rebound")
                .field("transferred", transferred)
                .field("replacement", &"<dyn ServicePipe>")
                .finish(),
        }
    }
}

/// Result of a guest send: an outcome or a status error.
pub type SendResult = Result<SendOutcome, hostpipe_types::TransferError>;

/// A service-specific pipe implementation.
///
/// All `on_guest_*` methods are invoked on the device thread while the VM
/// lock is held, so implementations may assume single-threaded access to
/// their own state during these calls. None of them may block: waiting is
/// expressed by returning `Again` from a transfer, asking for a wake through
/// `on_guest_want_wake_on`, and signaling the wake asynchronously from
/// [`PipeContext::signal_wake`].
///
/// A service pipe must not call `signal_wake` or `close_from_host` from
/// within a guest-initiated call; those are for host-initiated asynchronous
/// events only.
pub trait ServicePipe: Send {
    /// The guest closed the pipe. Must release all resources before
    /// returning; the core drops the pipe right after this call.
    fn on_guest_close(&mut self, reason: CloseReason);

    /// Poll the pipe state.
    fn on_guest_poll(&self) -> PollFlags;

    /// The guest wants to receive data into `bufs`. Returns the number of
    /// bytes transferred, 0 for end-of-stream, or a status error.
    fn on_guest_recv(&mut self, bufs: &mut [&mut [u8]]) -> TransferResult;

    /// The guest wants to send the data in `bufs`. May transfer fewer bytes
    /// than the vector holds; the guest layer loops.
    fn on_guest_send(&mut self, bufs: &[&[u8]]) -> SendResult;

    /// The guest asks to be woken when any event in `flags` occurs. A
    /// subsequent matching event must produce a wake.
    fn on_guest_want_wake_on(&mut self, flags: WakeFlags);

    /// Saves the pipe state to a snapshot. Only called when the owning
    /// service reports `can_load`.
    fn on_save(&self, _writer: &mut SnapshotWriter<'_>) -> io::Result<()> {
        Ok(())
    }
}

/// Factory for pipes of one named service, registered once at startup.
pub trait Service: Send + Sync {
    /// The registration name guests connect to.
    fn name(&self) -> &str;

    /// Creates a new pipe instance for a connecting guest. Returning `None`
    /// is a service-initiated refusal; the core surfaces it to the guest as
    /// a connection failure.
    fn create(
        &self,
        ctx: PipeContext,
        flags: OpenFlags,
        args: Option<&str>,
    ) -> Option<Box<dyn ServicePipe>>;

    /// Whether pipe instances of this service can be restored from a
    /// snapshot. When false, live pipes are force-closed across save/load.
    fn can_load(&self) -> bool {
        false
    }

    /// Restores one pipe instance from a snapshot. Only called when
    /// `can_load` is true.
    fn load(
        &self,
        _ctx: PipeContext,
        _args: Option<&str>,
        _reader: &mut SnapshotReader<'_>,
    ) -> Option<Box<dyn ServicePipe>> {
        None
    }

    /// Called once per whole-VM save, before any pipe is saved.
    fn pre_save(&self, _writer: &mut SnapshotWriter<'_>) -> io::Result<()> {
        Ok(())
    }

    /// Called once per whole-VM save, after every pipe was saved.
    fn post_save(&self, _writer: &mut SnapshotWriter<'_>) -> io::Result<()> {
        Ok(())
    }

    /// Called once per whole-VM load, before any pipe is loaded.
    fn pre_load(&self, _reader: &mut SnapshotReader<'_>) -> io::Result<()> {
        Ok(())
    }

    /// Called once per whole-VM load, after every pipe was loaded.
    fn post_load(&self, _reader: &mut SnapshotReader<'_>) -> io::Result<()> {
        Ok(())
    }
}
