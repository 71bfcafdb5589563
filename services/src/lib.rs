//! Built-in pipe services.
//!
//! Each service here implements the factory contract from `hostpipe-pipe`
//! and is registered on a manager by name:
//!
//! - `debug-sink` — write-only sink forwarding guest bytes to a host stream.
//! - `process-tracker` — allocates a process id per guest open and runs a
//!   cleanup callback when the guest side goes away.
//! - `clipboard` — double-buffered guest/host clipboard synchronization.
//! - `network` — out-of-band host-to-guest command channel.
//! - `pingpong` / `zero` — the loopback and null services used to exercise
//!   the pipe device itself.

mod clipboard;
mod debug;
mod network;
mod pingpong;
mod process;
mod zero;

pub use clipboard::{ClipboardService, GuestClipboardCallback};
pub use debug::DebugSinkService;
pub use network::NetworkCommandService;
pub use pingpong::PingPongService;
pub use process::ProcessTrackerService;
pub use zero::ZeroService;
