use hostpipe_types::{PipeId, WakeFlags};

/// Capability view of the hardware endpoint owned by the virtual device.
///
/// The core never owns the device side; it keeps a non-owning reference and
/// calls through this vtable on the device thread only.
pub trait HwPipe: Send + Sync {
    /// Asks the device to tear down its side and signal hangup to the guest.
    fn close_from_host(&self);

    /// Raises a virtual wake interrupt with the given event flags.
    fn signal_wake(&self, flags: WakeFlags);

    /// The pipe identifier, used for diagnostics and snapshot keying.
    fn id(&self) -> PipeId;

    /// Invoked when the host endpoint is replaced on service connect, so
    /// virtio-style transports can rebind their own mapping. Other
    /// transports ignore it.
    fn rebind_notify(&self) {}
}
