//! Service registry

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hostpipe_error::RegistryError;
use hostpipe_logger::debug;
use parking_lot::RwLock;

use crate::service::Service;

/// Maps service names to their factories.
///
/// Services register once at emulator startup; the registry freezes when the
/// first guest connection is opened and rejects registrations after that.
/// `reset_all` reopens it between test cases.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
    frozen: AtomicBool,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service under its own name.
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), RegistryError> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(RegistryError::Frozen);
        }
        let name = service.name().to_string();
        let mut services = self.services.write();
        if services.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        debug!("registered pipe service {}", name);
        services.insert(name, service);
        Ok(())
    }

    /// Looks a factory up by service name. Case-sensitive, no trimming.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.read().get(name).cloned()
    }

    /// Stops accepting registrations. Invoked on the first guest open.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Whether the registry still accepts registrations.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Clears every registration and unfreezes. Test hook.
    pub fn reset_all(&self) {
        self.services.write().clear();
        self.frozen.store(false, Ordering::Release);
    }

    /// All registered services, ordered by name so per-snapshot hooks run in
    /// a stable order.
    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        let mut services: Vec<_> = self.services.read().values().cloned().collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PipeContext;
    use crate::service::ServicePipe;
    use hostpipe_types::OpenFlags;

    struct NullService(&'static str);

    impl Service for NullService {
        fn name(&self) -> &str {
            self.0
        }

        fn create(
            &self,
            _ctx: PipeContext,
            _flags: OpenFlags,
            _args: Option<&str>,
        ) -> Option<Box<dyn ServicePipe>> {
            None
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(NullService("zero"))).unwrap();
        assert!(registry.lookup("zero").is_some());
        assert!(registry.lookup("Zero").is_none());
        assert!(registry.lookup("zero ").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(NullService("zero"))).unwrap();
        assert_eq!(
            registry.register(Arc::new(NullService("zero"))),
            Err(RegistryError::Duplicate("zero".to_string()))
        );
    }

    #[test]
    fn frozen_registry_rejects_registrations() {
        let registry = ServiceRegistry::new();
        registry.freeze();
        assert_eq!(
            registry.register(Arc::new(NullService("zero"))),
            Err(RegistryError::Frozen)
        );
        registry.reset_all();
        registry.register(Arc::new(NullService("zero"))).unwrap();
    }

    #[test]
    fn services_are_ordered_by_name() {
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(NullService("b"))).unwrap();
        registry.register(Arc::new(NullService("a"))).unwrap();
        let names: Vec<_> = registry.services().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["a", "b"]);
    }
}
