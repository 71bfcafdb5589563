//! Handle registry, message senders and the async message pipe service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use hostpipe_error::Result;
use hostpipe_logger::warn;
use hostpipe_manager::PipeManager;
use hostpipe_pipe::{PipeContext, Service, ServicePipe};
use hostpipe_types::stream::SnapshotReader;
use hostpipe_types::{CloseReason, OpenFlags, WakeFlags};
use parking_lot::Mutex;

use crate::handle::AsyncMessagePipeHandle;
use crate::pipe::{AsyncMessagePipe, Outbound, Parser};

/// Consumer of complete inbound messages.
///
/// Invoked synchronously on the device thread from the guest's send path.
/// Handlers that need to reply from other threads capture the
/// [`MessageSender`] given to the factory at construction.
pub trait MessageHandler: Send {
    /// A complete framed message arrived from the guest.
    fn on_message(&mut self, message: Vec<u8>);
}

#[derive(Clone)]
pub(crate) struct RegistryEntry {
    pub(crate) outbound: Arc<Mutex<Outbound>>,
    pub(crate) ctx: PipeContext,
}

/// Live pipes of one async message service, keyed by stable handle.
pub(crate) struct HandleRegistry {
    entries: Mutex<HashMap<AsyncMessagePipeHandle, RegistryEntry>>,
    next: AtomicU32,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        HandleRegistry {
            entries: Mutex::new(HashMap::new()),
            next: AtomicU32::new(1),
        }
    }
}

impl HandleRegistry {
    fn allocate(&self) -> AsyncMessagePipeHandle {
        AsyncMessagePipeHandle::new(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, handle: AsyncMessagePipeHandle, entry: RegistryEntry) {
        // Keep the allocator ahead of restored handles even when the
        // embedder skips the pre-load hook.
        self.next.fetch_max(handle.value() + 1, Ordering::Relaxed);
        self.entries.lock().insert(handle, entry);
    }

    /// Removes the handle only while it still belongs to `outbound`; a
    /// stale pipe being dropped after a snapshot reload must not evict the
    /// restored entry.
    pub(crate) fn remove(&self, handle: AsyncMessagePipeHandle, outbound: &Arc<Mutex<Outbound>>) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&handle) {
            if Arc::ptr_eq(&entry.outbound, outbound) {
                entries.remove(&handle);
            }
        }
    }

    fn get(&self, handle: AsyncMessagePipeHandle) -> Option<RegistryEntry> {
        self.entries.lock().get(&handle).cloned()
    }
}

/// Clonable sending half of an async message pipe.
///
/// Safe to hold on any thread and past the pipe's destruction: a send to a
/// destroyed pipe is discarded and reports `false`.
#[derive(Clone)]
pub struct MessageSender {
    registry: Weak<HandleRegistry>,
    handle: AsyncMessagePipeHandle,
}

impl MessageSender {
    /// The handle of the pipe this sender feeds.
    pub fn handle(&self) -> AsyncMessagePipeHandle {
        self.handle
    }

    /// Queues one outbound message and signals a read wake. Returns whether
    /// the message was accepted.
    pub fn send(&self, message: Vec<u8>) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let Some(entry) = registry.get(self.handle) else {
            return false;
        };
        let pushed = entry.outbound.lock().push(message);
        match pushed {
            Ok(()) => {
                entry.ctx.signal_wake(WakeFlags::READ);
                true
            }
            Err(()) => {
                warn!(
                    "async pipe {}: outbound queue over {} bytes, closing",
                    self.handle,
                    crate::MAX_QUEUED_BYTES
                );
                entry.ctx.close_from_host(CloseReason::Error);
                false
            }
        }
    }
}

/// Factory producing one message handler per connected pipe.
pub type HandlerFactory = Box<dyn Fn(MessageSender) -> Box<dyn MessageHandler> + Send + Sync>;

/// A pipe service whose instances speak the length-prefixed message format.
pub struct AsyncMessageService {
    name: String,
    registry: Arc<HandleRegistry>,
    factory: HandlerFactory,
}

impl AsyncMessageService {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(MessageSender) -> Box<dyn MessageHandler> + Send + Sync + 'static,
    {
        AsyncMessageService {
            name: name.into(),
            registry: Arc::new(HandleRegistry::default()),
            factory: Box::new(factory),
        }
    }

    /// Resolves a handle to a live sender; `None` means the pipe is gone.
    pub fn get_pipe(&self, handle: AsyncMessagePipeHandle) -> Option<MessageSender> {
        self.registry.get(handle).map(|_| MessageSender {
            registry: Arc::downgrade(&self.registry),
            handle,
        })
    }

    fn build_pipe(
        &self,
        handle: AsyncMessagePipeHandle,
        ctx: PipeContext,
        parser: Parser,
        outbound: Outbound,
    ) -> Box<dyn ServicePipe> {
        let outbound = Arc::new(Mutex::new(outbound));
        self.registry.insert(handle, RegistryEntry {
            outbound: Arc::clone(&outbound),
            ctx: ctx.clone(),
        });
        let sender = MessageSender {
            registry: Arc::downgrade(&self.registry),
            handle,
        };
        let handler = (self.factory)(sender);
        Box::new(AsyncMessagePipe::new(
            handle,
            ctx,
            parser,
            outbound,
            handler,
            Arc::downgrade(&self.registry),
        ))
    }
}

impl Service for AsyncMessageService {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(
        &self,
        ctx: PipeContext,
        _flags: OpenFlags,
        _args: Option<&str>,
    ) -> Option<Box<dyn ServicePipe>> {
        let handle = self.registry.allocate();
        Some(self.build_pipe(handle, ctx, Parser::default(), Outbound::default()))
    }

    fn can_load(&self) -> bool {
        true
    }

    fn load(
        &self,
        ctx: PipeContext,
        _args: Option<&str>,
        reader: &mut SnapshotReader<'_>,
    ) -> Option<Box<dyn ServicePipe>> {
        let handle = AsyncMessagePipeHandle::new(reader.get_le32().ok()?);
        let outbound = Outbound::load(reader).ok()?;
        let parser = Parser::load(reader).ok()?;
        Some(self.build_pipe(handle, ctx, parser, outbound))
    }

    fn pre_save(
        &self,
        writer: &mut hostpipe_types::stream::SnapshotWriter<'_>,
    ) -> std::io::Result<()> {
        writer.put_le32(self.registry.next.load(Ordering::Relaxed))
    }

    fn pre_load(&self, reader: &mut SnapshotReader<'_>) -> std::io::Result<()> {
        let next = reader.get_le32()?;
        self.registry.next.store(next, Ordering::Relaxed);
        Ok(())
    }
}

struct CallbackHandler<F>
where
    F: Fn(Vec<u8>, &MessageSender) + Send + Sync,
{
    sender: MessageSender,
    callback: Arc<F>,
}

impl<F> MessageHandler for CallbackHandler<F>
where
    F: Fn(Vec<u8>, &MessageSender) + Send + Sync,
{
    fn on_message(&mut self, message: Vec<u8>) {
        (self.callback)(message, &self.sender);
    }
}

/// Registers a message service backed by a plain closure, for services with
/// no per-pipe state. The closure receives each inbound message and the
/// sender of the pipe it arrived on.
pub fn register_simple_message_service<F>(
    manager: &PipeManager,
    name: impl Into<String>,
    on_message: F,
) -> Result<Arc<AsyncMessageService>>
where
    F: Fn(Vec<u8>, &MessageSender) + Send + Sync + 'static,
{
    let callback = Arc::new(on_message);
    let service = Arc::new(AsyncMessageService::new(name, move |sender| {
        Box::new(CallbackHandler {
            sender,
            callback: Arc::clone(&callback),
        }) as Box<dyn MessageHandler>
    }));
    manager.register_service(Arc::clone(&service) as Arc<dyn Service>)?;
    Ok(service)
}
