//! Out-of-band network command channel.
//!
//! The host pushes command bytes at a connected guest pipe; the guest only
//! ever reads. Connection state is never carried across snapshots, so these
//! pipes force-close on load and the guest reconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hostpipe_error::{Error, Result};
use hostpipe_pipe::{PipeContext, SendOutcome, SendResult, Service, ServicePipe, transfer};
use hostpipe_types::{
    CloseReason, OpenFlags, PollFlags, TransferError, TransferResult, WakeFlags,
};
use parking_lot::Mutex;

struct ActiveNetPipe {
    ctx: PipeContext,
    buf: Arc<Mutex<Vec<u8>>>,
    available: Arc<AtomicBool>,
}

#[derive(Default)]
struct NetShared {
    pipes: Mutex<Vec<ActiveNetPipe>>,
}

/// Delivers host-originated command bytes into the guest.
#[derive(Default)]
pub struct NetworkCommandService {
    shared: Arc<NetShared>,
}

impl NetworkCommandService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a command on the first connected pipe and wakes the guest.
    /// Errors when no guest has the pipe open.
    pub fn send_command(&self, command: &[u8]) -> Result<usize> {
        if command.is_empty() {
            return Ok(0);
        }
        let pipes = self.shared.pipes.lock();
        let Some(pipe) = pipes.first() else {
            return Err(Error::NotConnected("network".to_string()));
        };
        pipe.buf.lock().extend_from_slice(command);
        pipe.available.store(true, Ordering::SeqCst);
        pipe.ctx.signal_wake(WakeFlags::READ);
        Ok(command.len())
    }

    /// Whether any guest currently has the command pipe open.
    pub fn is_connected(&self) -> bool {
        !self.shared.pipes.lock().is_empty()
    }
}

impl Service for NetworkCommandService {
    fn name(&self) -> &str {
        "network"
    }

    fn create(
        &self,
        ctx: PipeContext,
        _flags: OpenFlags,
        _args: Option<&str>,
    ) -> Option<Box<dyn ServicePipe>> {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let available = Arc::new(AtomicBool::new(false));
        self.shared.pipes.lock().push(ActiveNetPipe {
            ctx,
            buf: Arc::clone(&buf),
            available: Arc::clone(&available),
        });
        Some(Box::new(NetworkPipe {
            shared: Arc::clone(&self.shared),
            buf,
            available,
        }))
    }
}

struct NetworkPipe {
    shared: Arc<NetShared>,
    buf: Arc<Mutex<Vec<u8>>>,
    available: Arc<AtomicBool>,
}

impl ServicePipe for NetworkPipe {
    fn on_guest_close(&mut self, _reason: CloseReason) {
        let mut pipes = self.shared.pipes.lock();
        pipes.retain(|p| !Arc::ptr_eq(&p.buf, &self.buf));
    }

    fn on_guest_poll(&self) -> PollFlags {
        if self.available.load(Ordering::SeqCst) {
            PollFlags::IN | PollFlags::OUT
        } else {
            PollFlags::OUT
        }
    }

    fn on_guest_recv(&mut self, bufs: &mut [&mut [u8]]) -> TransferResult {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransferError::Again);
        }
        let mut pending = self.buf.lock();
        let n = transfer::scatter(&pending, bufs);
        if n == 0 {
            return Err(TransferError::Again);
        }
        pending.drain(..n);
        if pending.is_empty() {
            self.available.store(false, Ordering::SeqCst);
        }
        Ok(n)
    }

    fn on_guest_send(&mut self, bufs: &[&[u8]]) -> SendResult {
        // Guest-to-host traffic is ignored on this channel.
        Ok(SendOutcome::Transferred(transfer::vector_len(bufs)))
    }

    fn on_guest_want_wake_on(&mut self, _flags: WakeFlags) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostpipe_test_device::TestPipeDevice;

    fn network_device() -> (TestPipeDevice, Arc<NetworkCommandService>) {
        let device = TestPipeDevice::new();
        let service = Arc::new(NetworkCommandService::new());
        device
            .manager()
            .register_service(Arc::clone(&service) as Arc<dyn Service>)
            .unwrap();
        (device, service)
    }

    #[test]
    fn commands_flip_readability_and_drain_in_order() {
        let (device, service) = network_device();
        let guest = device.connect("network").unwrap();
        assert_eq!(guest.poll(), PollFlags::OUT);

        service.send_command(b"dns 10.0.2.3").unwrap();
        service.send_command(b"\nup").unwrap();
        assert_eq!(guest.poll(), PollFlags::IN | PollFlags::OUT);

        let mut buf = [0u8; 64];
        let n = guest.read(&mut buf);
        assert_eq!(&buf[..n as usize], b"dns 10.0.2.3\nup");
        assert_eq!(guest.poll(), PollFlags::OUT);
    }

    #[test]
    fn send_without_a_connected_guest_fails() {
        let (_device, service) = network_device();
        assert!(service.send_command(b"x").is_err());
        assert!(!service.is_connected());
    }

    #[test]
    fn guest_close_disconnects_the_channel() {
        let (device, service) = network_device();
        let guest = device.connect("network").unwrap();
        assert!(service.is_connected());
        guest.close();
        assert!(!service.is_connected());
        assert!(service.send_command(b"x").is_err());
    }

    #[test]
    fn guest_writes_are_ignored() {
        let (device, _service) = network_device();
        let guest = device.connect("network").unwrap();
        assert_eq!(guest.write(b"guest chatter"), 13);
        assert_eq!(guest.poll(), PollFlags::OUT);
    }

    #[test]
    fn snapshot_force_closes_the_pipe() {
        let (device, _service) = network_device();
        let guest = device.connect("network").unwrap();
        let snapshot = device.snapshot_save().unwrap();
        guest.close();
        drop(device);

        let (restored_device, restored_service) = network_device();
        let guests = restored_device.snapshot_load(&snapshot).unwrap();
        assert_eq!(guests.len(), 1);
        assert_eq!(guests[0].poll(), PollFlags::HUP);
        assert!(!restored_service.is_connected());
        restored_device.pump();
        assert!(guests[0].hw().is_closed_from_host());
    }
}
