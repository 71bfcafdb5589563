//! Asynchronous message pipes.
//!
//! A framing layer over the raw service-pipe contract for services that
//! prefer discrete messages to byte streams. Every message on the wire is a
//! little-endian u32 payload length followed by exactly that many bytes, in
//! both directions.
//!
//! Outbound messages go through a per-pipe FIFO that may be filled from any
//! thread via a [`MessageSender`]; the guest drains it with ordinary reads,
//! message boundaries preserved. Each pipe gets a stable
//! [`AsyncMessagePipeHandle`] so callbacks dispatched to worker threads can
//! keep a sender that safely turns into a no-op once the pipe is gone.

mod handle;
mod pipe;
mod service;

pub use handle::AsyncMessagePipeHandle;
pub use service::{
    AsyncMessageService, MessageHandler, MessageSender, register_simple_message_service,
};

/// Largest payload a peer may declare in a length prefix. A larger prefix
/// closes the pipe before any allocation happens.
pub const MAX_MESSAGE_SIZE: usize = 16 << 20;

/// Ceiling on bytes queued outbound per pipe. A send that would cross it is
/// discarded and the pipe is closed; the guest must not be able to grow the
/// queue without bound by refusing to read.
pub const MAX_QUEUED_BYTES: usize = 16 << 20;
