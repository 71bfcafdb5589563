//! Guest/host ABI constants and shared data types.
//!
//! The numeric values in this crate are shared with the guest kernel driver
//! and the virtual device implementation. They must never be renumbered.

mod flags;
mod id;
mod status;
pub mod stream;

pub use flags::{OpenFlags, PollFlags, WakeFlags};
pub use id::PipeId;
pub use status::{
    CloseReason, PIPE_ERROR_AGAIN, PIPE_ERROR_INVAL, PIPE_ERROR_IO, PIPE_ERROR_NOMEM,
    TransferError, TransferResult, raw_transfer_result,
};
