//! The log facade used by all hostpipe crates.
//!
//! This crate only forwards to [`log`]; binding an actual logger
//! implementation is left to the embedding application (or `env_logger` in
//! tests).

pub use log::{self, Level, debug, error, info, log_enabled, trace, warn};
