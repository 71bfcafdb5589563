//! The global VM-lock capability.
//!
//! All guest-visible pipe state is mutated on whichever thread currently
//! holds the hypervisor's VM lock; that thread is called the device thread.
//! The core only needs two capabilities from the hypervisor primitive: hold
//! the lock, and answer whether the calling thread is the one holding it.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

/// Capability view of the hypervisor's exclusive VM-state lock.
pub trait VmLock: Send + Sync {
    /// Acquires the lock, blocking until it is available.
    fn lock(&self);

    /// Releases the lock.
    fn unlock(&self);

    /// Whether the calling thread currently holds the lock.
    fn is_locked_by_self(&self) -> bool;
}

/// RAII guard that holds the VM lock unconditionally for its lifetime.
pub struct ScopedVmLock<'a> {
    lock: &'a dyn VmLock,
}

impl<'a> ScopedVmLock<'a> {
    pub fn new(lock: &'a dyn VmLock) -> Self {
        lock.lock();
        ScopedVmLock { lock }
    }
}

impl Drop for ScopedVmLock<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// RAII guard that acquires the VM lock only when the calling thread does not
/// already hold it, for implementations that are not re-entrant.
pub struct RecursiveScopedVmLock<'a> {
    lock: &'a dyn VmLock,
    acquired: bool,
}

impl<'a> RecursiveScopedVmLock<'a> {
    pub fn new(lock: &'a dyn VmLock) -> Self {
        let acquired = !lock.is_locked_by_self();
        if acquired {
            lock.lock();
        }
        RecursiveScopedVmLock { lock, acquired }
    }
}

impl Drop for RecursiveScopedVmLock<'_> {
    fn drop(&mut self) {
        if self.acquired {
            self.lock.unlock();
        }
    }
}

#[derive(Default)]
struct OwnerState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Process-local VM lock used when the embedding hypervisor does not supply
/// its own. Re-entrant on the owning thread.
#[derive(Default)]
pub struct HostVmLock {
    state: Mutex<OwnerState>,
    available: Condvar,
}

impl HostVmLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VmLock for HostVmLock {
    fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            state.depth += 1;
            return;
        }
        while state.owner.is_some() {
            self.available.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = 1;
    }

    fn unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert_eq!(state.owner, Some(me), "unlock from a non-owner thread");
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.available.notify_one();
        }
    }

    fn is_locked_by_self(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }
}
