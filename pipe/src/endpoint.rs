//! The host endpoint: per-pipe state owned by the core.

use std::mem;

use hostpipe_types::{CloseReason, PollFlags, TransferError, TransferResult, WakeFlags};

use crate::connector::Connector;
use crate::service::ServicePipe;

/// The three identities a host endpoint moves through.
///
/// The variants differ in identity, not method set, so they are modeled as a
/// tagged enum rather than through the service-pipe trait.
pub enum HostEndpoint {
    /// Reading the NUL-terminated service name from the guest.
    Connector(Connector),
    /// All operations delegate to the bound service pipe.
    Bound(Box<dyn ServicePipe>),
    /// Rejects all operations; retained until the hardware endpoint
    /// acknowledges teardown.
    Closed(CloseReason),
}

impl HostEndpoint {
    /// A fresh endpoint in connector state.
    pub fn new_connector() -> Self {
        HostEndpoint::Connector(Connector::new())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, HostEndpoint::Closed(_))
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, HostEndpoint::Bound(_))
    }

    /// Poll state as seen by the guest.
    pub fn poll(&self) -> PollFlags {
        match self {
            // The connector only ever wants the service name written.
            HostEndpoint::Connector(_) => PollFlags::OUT,
            HostEndpoint::Bound(pipe) => pipe.on_guest_poll(),
            HostEndpoint::Closed(_) => PollFlags::HUP,
        }
    }

    /// Guest receive. Connectors never produce data; closed endpoints report
    /// end-of-stream.
    pub fn recv(&mut self, bufs: &mut [&mut [u8]]) -> TransferResult {
        match self {
            HostEndpoint::Connector(_) => Err(TransferError::Again),
            HostEndpoint::Bound(pipe) => pipe.on_guest_recv(bufs),
            HostEndpoint::Closed(_) => Ok(0),
        }
    }

    /// Guest wake request. Only a bound service tracks wanted events.
    pub fn want_wake_on(&mut self, flags: WakeFlags) {
        if let HostEndpoint::Bound(pipe) = self {
            pipe.on_guest_want_wake_on(flags);
        }
    }

    /// Transitions to `Closed`, destroying the bound service pipe (its
    /// `on_guest_close` runs first) or discarding the connector buffer.
    pub fn close(&mut self, reason: CloseReason) {
        let previous = mem::replace(self, HostEndpoint::Closed(reason));
        if let HostEndpoint::Bound(mut pipe) = previous {
            pipe.on_guest_close(reason);
        }
    }

    /// Replaces the endpoint with a bound service pipe.
    pub fn bind(&mut self, pipe: Box<dyn ServicePipe>) {
        *self = HostEndpoint::Bound(pipe);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::service::{SendOutcome, SendResult};
    use hostpipe_types::TransferResult;

    struct CloseProbe {
        closed: Arc<AtomicBool>,
    }

    impl ServicePipe for CloseProbe {
        fn on_guest_close(&mut self, reason: CloseReason) {
            assert_eq!(reason, CloseReason::Reboot);
            self.closed.store(true, Ordering::SeqCst);
        }

        fn on_guest_poll(&self) -> PollFlags {
            PollFlags::IN
        }

        fn on_guest_recv(&mut self, _bufs: &mut [&mut [u8]]) -> TransferResult {
            Ok(1)
        }

        fn on_guest_send(&mut self, _bufs: &[&[u8]]) -> SendResult {
            Ok(SendOutcome::Transferred(1))
        }

        fn on_guest_want_wake_on(&mut self, _flags: WakeFlags) {}
    }

    #[test]
    fn connector_endpoints_report_write_only() {
        let mut endpoint = HostEndpoint::new_connector();
        assert_eq!(endpoint.poll(), PollFlags::OUT);
        let mut buf = [0u8; 4];
        assert_eq!(endpoint.recv(&mut [&mut buf]), Err(TransferError::Again));
    }

    #[test]
    fn close_destroys_the_service_pipe_first() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut endpoint = HostEndpoint::Bound(Box::new(CloseProbe {
            closed: Arc::clone(&closed),
        }));
        endpoint.close(CloseReason::Reboot);
        assert!(closed.load(Ordering::SeqCst));
        assert!(endpoint.is_closed());
    }

    #[test]
    fn closed_endpoints_report_hangup_and_eof() {
        let mut endpoint = HostEndpoint::Closed(CloseReason::Graceful);
        assert_eq!(endpoint.poll(), PollFlags::HUP);
        let mut buf = [0u8; 4];
        assert_eq!(endpoint.recv(&mut [&mut buf]), Ok(0));
    }
}
