//! The building blocks of the host pipe multiplexer.
//!
//! A pipe connects a hardware endpoint owned by the virtual device to a host
//! endpoint owned by the core. The host endpoint starts life as a connector
//! that reads the NUL-terminated service name from the guest's first writes,
//! then hands over to a service pipe produced by a registered factory.
//!
//! This crate defines the service-pipe contract and everything beneath it;
//! the live-pipe table and the device entry points live in
//! `hostpipe-manager`.

mod connector;
mod context;
mod endpoint;
mod hw;
mod ops;
mod registry;
mod service;
pub mod transfer;

pub use connector::{ConnectRequest, Connector, ConnectorProgress, MAX_SERVICE_NAME_BUFFER};
pub use context::{PipeContext, PipeWaker};
pub use endpoint::HostEndpoint;
pub use hw::HwPipe;
pub use ops::{DeferredOp, OpQueue};
pub use registry::ServiceRegistry;
pub use service::{SendOutcome, SendResult, Service, ServicePipe};
