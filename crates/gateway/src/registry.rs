//! Membership of live device connections.
//!
//! The membership map sits behind one global lock that is only held for
//! insert, lookup, and removal. Everything that changes per-device state
//! (pending commands, last known state) takes that device's own lock, which is
//! created once on admission and lives inside the entry. When both are needed
//! the global lock is taken first.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use shared::domain::{CommandId, DeviceId};
use shared::protocol::ResponseFrame;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::{
    error::{AdmitError, CommandError},
    link::DeviceLink,
};

const ESTABLISHED: &str = "established";

pub(crate) type ResponseSlot = oneshot::Sender<ResponseFrame>;

pub(crate) struct DeviceEntry {
    pub(crate) device_id: DeviceId,
    pub(crate) link: DeviceLink,
    pub(crate) state: Mutex<DeviceState>,
}

pub(crate) struct DeviceState {
    pub(crate) last_known_state: String,
    pub(crate) pending: HashMap<CommandId, ResponseSlot>,
    /// Set once the entry has been torn down; no new command may register.
    pub(crate) closed: bool,
}

impl DeviceEntry {
    fn new(device_id: DeviceId, link: DeviceLink) -> Self {
        Self {
            device_id,
            link,
            state: Mutex::new(DeviceState {
                last_known_state: ESTABLISHED.to_string(),
                pending: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Drops every outstanding response slot, which wakes each waiter with
    /// a closed-channel error.
    fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let abandoned = state.pending.len();
        state.pending.clear();
        abandoned
    }
}

/// Handle for one admitted connection. The read loop serves, and finally
/// tears down, exactly the entry this was issued for, even if the device has
/// been removed and readmitted in the meantime.
pub struct Admission {
    pub(crate) entry: Arc<DeviceEntry>,
}

impl Admission {
    pub fn device_id(&self) -> &DeviceId {
        &self.entry.device_id
    }
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("device_id", &self.entry.device_id)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    devices: Mutex<HashMap<DeviceId, Arc<DeviceEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `link` as the live connection for `device_id`.
    ///
    /// A second connection for an identity that is already present is
    /// rejected and the existing entry is left untouched; closing the
    /// rejected transport is the caller's job.
    pub fn admit(&self, device_id: &DeviceId, link: DeviceLink) -> Result<Admission, AdmitError> {
        let mut devices = self.devices.lock();
        if devices.contains_key(device_id) {
            warn!(%device_id, "rejected duplicate device connection");
            return Err(AdmitError::DuplicateConnection);
        }
        let entry = Arc::new(DeviceEntry::new(device_id.clone(), link));
        devices.insert(device_id.clone(), Arc::clone(&entry));
        info!(%device_id, "device connection admitted");
        Ok(Admission { entry })
    }

    pub fn lookup(&self, device_id: &DeviceId) -> Result<DeviceLink, CommandError> {
        self.entry(device_id).map(|entry| entry.link.clone())
    }

    pub(crate) fn entry(&self, device_id: &DeviceId) -> Result<Arc<DeviceEntry>, CommandError> {
        self.devices
            .lock()
            .get(device_id)
            .cloned()
            .ok_or(CommandError::NotConnected)
    }

    /// Tears down whatever entry is registered for `device_id`. Safe to call
    /// when nothing is registered.
    pub fn remove(&self, device_id: &DeviceId) -> bool {
        let mut devices = self.devices.lock();
        let Some(entry) = devices.remove(device_id) else {
            return false;
        };
        let abandoned = entry.close();
        info!(%device_id, abandoned, "device connection removed");
        true
    }

    /// Like [`remove`](Self::remove), but only if `entry` is still the
    /// registered one. A read loop finishing late must not evict a newer
    /// connection that was admitted after its own was removed.
    pub(crate) fn remove_entry(&self, entry: &Arc<DeviceEntry>) -> bool {
        let mut devices = self.devices.lock();
        let is_current = devices
            .get(&entry.device_id)
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        if is_current {
            devices.remove(&entry.device_id);
        }
        let abandoned = entry.close();
        if is_current {
            info!(device_id = %entry.device_id, abandoned, "device connection removed");
        }
        is_current
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.devices.lock().contains_key(device_id)
    }

    pub fn last_known_state(&self, device_id: &DeviceId) -> Option<String> {
        let entry = self.entry(device_id).ok()?;
        let state = entry.state.lock();
        Some(state.last_known_state.clone())
    }

    pub fn pending_commands(&self, device_id: &DeviceId) -> usize {
        self.entry(device_id)
            .map(|entry| entry.state.lock().pending.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
