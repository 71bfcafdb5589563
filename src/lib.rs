//! Host-side pipe multiplexer for an emulated mobile device.
//!
//! A pipe is a fast bidirectional byte channel between one guest process
//! and one named host service. The virtual device raises guest register
//! writes into the [`PipeManager`] entry points; registered services
//! implement the [`ServicePipe`] contract on the other side.
//!
//! This crate re-exports the public API of the workspace and wires up the
//! built-in services.

use std::io;
use std::sync::Arc;

pub use hostpipe_async_message::{
    AsyncMessagePipeHandle, AsyncMessageService, MessageHandler, MessageSender,
    register_simple_message_service,
};
pub use hostpipe_error::{Error, Result};
pub use hostpipe_manager::PipeManager;
pub use hostpipe_pipe::{
    ConnectRequest, Connector, ConnectorProgress, DeferredOp, HostEndpoint, HwPipe, OpQueue,
    PipeContext, PipeWaker, SendOutcome, SendResult, Service, ServicePipe, ServiceRegistry,
    transfer,
};
pub use hostpipe_services::{
    ClipboardService, DebugSinkService, NetworkCommandService, PingPongService,
    ProcessTrackerService, ZeroService,
};
pub use hostpipe_types::{
    CloseReason, OpenFlags, PIPE_ERROR_AGAIN, PIPE_ERROR_INVAL, PIPE_ERROR_IO, PIPE_ERROR_NOMEM,
    PipeId, PollFlags, TransferError, TransferResult, WakeFlags, stream,
};
pub use hostpipe_vm_lock::{HostVmLock, RecursiveScopedVmLock, ScopedVmLock, VmLock};

/// Host-side handles to the built-in services.
pub struct BuiltinServices {
    pub clipboard: Arc<ClipboardService>,
    pub network: Arc<NetworkCommandService>,
    pub process_tracker: Arc<ProcessTrackerService>,
}

/// Registers the standard service set on a fresh manager. `debug_output`
/// replaces the default stderr sink of the `debug-sink` service.
pub fn register_builtin_services(
    manager: &PipeManager,
    debug_output: Option<Box<dyn io::Write + Send>>,
) -> Result<BuiltinServices> {
    let debug = match debug_output {
        Some(output) => DebugSinkService::new("debug-sink", Some(output)),
        None => DebugSinkService::with_stderr("debug-sink"),
    };
    manager.register_service(Arc::new(debug))?;

    let clipboard = Arc::new(ClipboardService::new());
    manager.register_service(Arc::clone(&clipboard) as Arc<dyn Service>)?;

    let network = Arc::new(NetworkCommandService::new());
    manager.register_service(Arc::clone(&network) as Arc<dyn Service>)?;

    let process_tracker = Arc::new(ProcessTrackerService::new());
    manager.register_service(Arc::clone(&process_tracker) as Arc<dyn Service>)?;

    Ok(BuiltinServices {
        clipboard,
        network,
        process_tracker,
    })
}

/// Registers the loopback services (`pingpong`, `zero`) used by device
/// self-tests.
pub fn register_loopback_services(manager: &PipeManager) -> Result<()> {
    manager.register_service(Arc::new(PingPongService::new()))?;
    manager.register_service(Arc::new(ZeroService::new()))?;
    Ok(())
}
