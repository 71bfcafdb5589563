//! The loopback service: every byte written comes back on the next read.

use hostpipe_pipe::{PipeContext, SendOutcome, SendResult, Service, ServicePipe, transfer};
use hostpipe_types::{
    CloseReason, OpenFlags, PollFlags, TransferError, TransferResult, WakeFlags,
};

/// Echoes guest writes back to guest reads, buffering in between.
#[derive(Default)]
pub struct PingPongService;

impl PingPongService {
    pub fn new() -> Self {
        PingPongService
    }
}

impl Service for PingPongService {
    fn name(&self) -> &str {
        "pingpong"
    }

    fn create(
        &self,
        ctx: PipeContext,
        _flags: OpenFlags,
        _args: Option<&str>,
    ) -> Option<Box<dyn ServicePipe>> {
        Some(Box::new(PingPongPipe {
            ctx,
            buf: Vec::new(),
            wanted_wakes: WakeFlags::empty(),
        }))
    }
}

struct PingPongPipe {
    ctx: PipeContext,
    buf: Vec<u8>,
    wanted_wakes: WakeFlags,
}

impl PingPongPipe {
    fn wake_reader_if_wanted(&mut self) {
        if self.wanted_wakes.contains(WakeFlags::READ) && !self.buf.is_empty() {
            self.wanted_wakes.remove(WakeFlags::READ);
            self.ctx.signal_wake(WakeFlags::READ);
        }
    }
}

impl ServicePipe for PingPongPipe {
    fn on_guest_close(&mut self, _reason: CloseReason) {
        self.buf.clear();
    }

    fn on_guest_poll(&self) -> PollFlags {
        let mut flags = PollFlags::OUT;
        if !self.buf.is_empty() {
            flags |= PollFlags::IN;
        }
        flags
    }

    fn on_guest_recv(&mut self, bufs: &mut [&mut [u8]]) -> TransferResult {
        if self.buf.is_empty() {
            return Err(TransferError::Again);
        }
        let n = transfer::scatter(&self.buf, bufs);
        self.buf.drain(..n);
        Ok(n)
    }

    fn on_guest_send(&mut self, bufs: &[&[u8]]) -> SendResult {
        let incoming = transfer::gather(bufs);
        self.buf.extend_from_slice(&incoming);
        self.wake_reader_if_wanted();
        Ok(SendOutcome::Transferred(incoming.len()))
    }

    fn on_guest_want_wake_on(&mut self, flags: WakeFlags) {
        self.wanted_wakes |= flags;
        self.wake_reader_if_wanted();
    }
}
