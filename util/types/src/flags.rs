//! Wake, poll and open-time flag sets.

use bitflags::bitflags;

bitflags! {
    /// Events signaled from the host to the virtual device to raise a guest
    /// wake interrupt, and the mask a guest passes to `wake_on` to ask for
    /// them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WakeFlags: u32 {
        /// The host closed the pipe.
        const CLOSED = 1 << 0;
        /// The pipe can now be read from.
        const READ = 1 << 1;
        /// The pipe can now be written to.
        const WRITE = 1 << 2;
        /// The transport may release DMA mappings held on behalf of the pipe.
        const UNLOCK_DMA = 1 << 3;
    }
}

bitflags! {
    /// Pipe readiness as reported to the guest by `poll`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollFlags: u32 {
        /// The guest can read.
        const IN = 1 << 0;
        /// The guest can write.
        const OUT = 1 << 1;
        /// Closed by the host.
        const HUP = 1 << 2;
    }
}

bitflags! {
    /// Transport properties reported by the virtual device when opening a
    /// pipe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// The pipe is carried over a virtio transport; the device keeps its
        /// own guest-physical mapping and must be told to rebind it when the
        /// host endpoint is replaced.
        const VIRTIO = 1 << 0;
    }
}
