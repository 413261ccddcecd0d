//! Index of connected sessions, keyed by device id.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::gateway::DeviceId;
use crate::gateway::runtime::SessionHandle;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<BTreeMap<DeviceId, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; returns the displaced handle when the device
    /// was already connected (the caller closes it).
    pub fn insert(&self, handle: SessionHandle) -> Option<SessionHandle> {
        self.inner
            .lock()
            .expect("registry lock")
            .insert(handle.device_id(), handle)
    }

    /// Remove `device_id`, but only if the registered handle is the one
    /// being torn down; a newer connection keeps its slot.
    pub fn remove(&self, device_id: &DeviceId, serial: u64) -> bool {
        let mut inner = self.inner.lock().expect("registry lock");
        match inner.get(device_id) {
            Some(handle) if handle.serial() == serial => {
                inner.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<SessionHandle> {
        self.inner.lock().expect("registry lock").get(device_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.inner.lock().expect("registry lock").keys().copied().collect()
    }
}
