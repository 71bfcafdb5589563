//! The null service: an unlimited source of zero bytes and sink for writes.

use hostpipe_pipe::{PipeContext, SendOutcome, SendResult, Service, ServicePipe, transfer};
use hostpipe_types::{CloseReason, OpenFlags, PollFlags, TransferResult, WakeFlags};

/// Reads deliver zeros, writes are discarded, both always make progress.
/// Used to measure raw pipe throughput and exercise the transfer path.
#[derive(Default)]
pub struct ZeroService;

impl ZeroService {
    pub fn new() -> Self {
        ZeroService
    }
}

impl Service for ZeroService {
    fn name(&self) -> &str {
        "zero"
    }

    fn create(
        &self,
        _ctx: PipeContext,
        _flags: OpenFlags,
        _args: Option<&str>,
    ) -> Option<Box<dyn ServicePipe>> {
        Some(Box::new(ZeroPipe))
    }
}

struct ZeroPipe;

impl ServicePipe for ZeroPipe {
    fn on_guest_close(&mut self, _reason: CloseReason) {}

    fn on_guest_poll(&self) -> PollFlags {
        PollFlags::IN | PollFlags::OUT
    }

    fn on_guest_recv(&mut self, bufs: &mut [&mut [u8]]) -> TransferResult {
        let mut filled = 0;
        for buf in bufs.iter_mut() {
            let n = buf.len().min(transfer::MAX_TRANSFER - filled);
            buf[..n].fill(0);
            filled += n;
            if filled == transfer::MAX_TRANSFER {
                break;
            }
        }
        Ok(filled)
    }

    fn on_guest_send(&mut self, bufs: &[&[u8]]) -> SendResult {
        Ok(SendOutcome::Transferred(transfer::vector_len(bufs)))
    }

    fn on_guest_want_wake_on(&mut self, _flags: WakeFlags) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostpipe_test_device::TestPipeDevice;
    use std::sync::Arc;

    #[test]
    fn reads_zeros_and_swallows_writes() {
        let device = TestPipeDevice::new();
        device
            .manager()
            .register_service(Arc::new(ZeroService::new()))
            .unwrap();
        let guest = device.connect("zero").unwrap();

        assert_eq!(guest.poll(), PollFlags::IN | PollFlags::OUT);
        assert_eq!(guest.write(b"ignored"), 7);

        let mut buf = [0xAAu8; 16];
        assert_eq!(guest.read(&mut buf), 16);
        assert_eq!(buf, [0u8; 16]);
    }
}
