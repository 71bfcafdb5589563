//! Transfer status codes and close reasons.

use std::fmt;

/// Raw status returned to the device for a malformed request.
pub const PIPE_ERROR_INVAL: i32 = -1;
/// Raw status returned to the device when no progress is possible yet.
pub const PIPE_ERROR_AGAIN: i32 = -2;
/// Raw status returned to the device when an allocation failed.
pub const PIPE_ERROR_NOMEM: i32 = -3;
/// Raw status returned to the device on an unrecoverable transport failure.
pub const PIPE_ERROR_IO: i32 = -4;

/// Why a transfer could not make progress.
///
/// The `Closed` variant is internal to the host side; on the device boundary
/// it shares the `io` code, since the raw ABI only knows the four negative
/// values above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// Malformed service name or request.
    Invalid,
    /// No data or buffer space available; retry after a wake.
    Again,
    /// Allocation failed while handling the buffer vector.
    NoMem,
    /// Unrecoverable failure on the service side.
    Io,
    /// The pipe has transitioned to its closed state.
    Closed,
}

impl TransferError {
    /// The negative status code for the device boundary.
    pub fn raw(self) -> i32 {
        match self {
            TransferError::Invalid => PIPE_ERROR_INVAL,
            TransferError::Again => PIPE_ERROR_AGAIN,
            TransferError::NoMem => PIPE_ERROR_NOMEM,
            TransferError::Io | TransferError::Closed => PIPE_ERROR_IO,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Result of moving bytes through a pipe: a byte count (0 is end-of-stream)
/// or a status error.
pub type TransferResult = Result<usize, TransferError>;

/// Collapses a transfer result into the numeric form consumed by the virtual
/// device.
pub fn raw_transfer_result(result: TransferResult) -> i32 {
    match result {
        Ok(n) => {
            debug_assert!(n <= i32::MAX as usize);
            n as i32
        }
        Err(e) => e.raw(),
    }
}

/// Why a pipe is being closed. Forwarded to the service pipe so it can
/// distinguish a normal user close from the whole VM being torn down.
///
/// The numeric values are shared with hardware-side code and must not be
/// renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    /// Guest closed the pipe.
    Graceful = 0,
    /// The whole VM is rebooting.
    Reboot = 1,
    /// The pipe could not be carried across a snapshot load.
    LoadSnapshot = 2,
    /// Error on the host side.
    Error = 3,
}

impl CloseReason {
    /// The wire value of this reason.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a wire value.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(CloseReason::Graceful),
            1 => Some(CloseReason::Reboot),
            2 => Some(CloseReason::LoadSnapshot),
            3 => Some(CloseReason::Error),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
