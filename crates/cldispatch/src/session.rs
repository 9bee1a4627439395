//! Per-device context and queue cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::backend::ComputeBackend;
use crate::catalog::{DeviceAddress, check_address};
use crate::error::{DispatchError, Result, Stage};

/// Process-scoped cache of one session per (platform, device) pair.
///
/// The registry owns the backend. Construct it once and share it with every
/// dispatcher; sessions are created on first use and live until
/// [`SessionRegistry::reset`] or drop. The returned sessions share a single
/// queue, so dispatches against the same device must be serialized by the
/// caller.
pub struct SessionRegistry<B: ComputeBackend> {
    backend: B,
    device_counts: Mutex<Option<Arc<[usize]>>>,
    sessions: Mutex<HashMap<DeviceAddress, Arc<B::Session>>>,
}

impl<B: ComputeBackend> SessionRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self { backend, device_counts: Mutex::new(None), sessions: Mutex::new(HashMap::new()) }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Return the session for the pair, creating it on first request.
    ///
    /// Indices are validated before any context is created.
    pub fn get(&self, platform: usize, device: usize) -> Result<Arc<B::Session>> {
        let counts = self.device_counts()?;
        let address = check_address(&counts, platform, device)?;

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.get(&address) {
            debug!(%address, "reusing cached session");
            return Ok(Arc::clone(session));
        }

        let session = self
            .backend
            .open_session(address)
            .map_err(DispatchError::runtime(Stage::OpenSession))?;
        let session = Arc::new(session);

        info!(%address, backend = self.backend.name(), "opened device session");
        sessions.insert(address, Arc::clone(&session));
        Ok(session)
    }

    pub fn contains(&self, address: DeviceAddress) -> bool {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached session and the device-count snapshot.
    ///
    /// Sessions still held by callers stay alive until their last `Arc`
    /// goes away.
    pub fn reset(&self) {
        let dropped = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let n = sessions.len();
            sessions.clear();
            n
        };
        *self.device_counts.lock().unwrap_or_else(PoisonError::into_inner) = None;
        debug!(dropped, "session registry reset");
    }

    fn device_counts(&self) -> Result<Arc<[usize]>> {
        let mut slot = self.device_counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(counts) = slot.as_ref() {
            return Ok(Arc::clone(counts));
        }
        let counts: Arc<[usize]> = self.backend.device_counts()?.into();
        *slot = Some(Arc::clone(&counts));
        Ok(counts)
    }
}

impl<B: ComputeBackend> std::fmt::Debug for SessionRegistry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("backend", &self.backend.name())
            .field("sessions", &self.len())
            .finish()
    }
}
