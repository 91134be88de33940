//! Process-wide named locks.
//!
//! Connectors that touch the same host-global state (the iSCSI session
//! table, the SCSI device list, the multipath map) share a lock name. The
//! registry is created once per process and handed to every connector
//! through the host context; a lock is held for the whole connect or
//! disconnect sequence and released when the guard drops, also on error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the lock called `name`.
    pub fn with_lock<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.get(name);
        debug!(lock = %name, "Acquiring lock");
        // A panic in a previous holder leaves no state behind the unit mutex.
        let _guard: MutexGuard<'_, ()> = lock.lock().unwrap_or_else(|e| e.into_inner());
        debug!(lock = %name, "Acquired lock");
        f()
    }

    /// Number of distinct lock names created so far.
    pub fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
