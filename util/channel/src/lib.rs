//! Reexports `crossbeam_channel` to uniform the dependency version.

pub use crossbeam_channel::{
    Receiver, RecvError, RecvTimeoutError, SendError, Sender, TryRecvError, TrySendError, after,
    bounded, select, tick, unbounded,
};

pub mod oneshot {
    //! A oneshot channel is used to send a single message between threads.
    use crossbeam_channel::{Receiver, Sender, bounded};

    /// Sender and receiver pair of a oneshot channel.
    pub type OneshotChannel<T> = (Sender<T>, Receiver<T>);

    /// Creates a oneshot channel.
    pub fn channel<T>() -> OneshotChannel<T> {
        bounded(1)
    }
}
