//! Process-wide cache of the last known value per device parameter.

use hmbridge_types::{base_device_id, DeviceEvent, DEFAULT_TRACKED_PARAMS};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Parameter → value for one device.
pub type DeviceState = BTreeMap<String, String>;

/// Mapping of channel-qualified device ID → parameter → last value.
///
/// Cloning yields another handle to the same table. Writes are plain key
/// overwrites (last write wins), so concurrent listeners need no ordering
/// between each other.
#[derive(Debug, Clone, Default)]
pub struct StateCache {
    inner: Arc<RwLock<HashMap<String, DeviceState>>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DeviceState>> {
        // A panicked writer cannot leave a half-written map entry behind.
        self.inner.read().unwrap_or_else(|poisoned| {
            tracing::error!("state cache lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DeviceState>> {
        self.inner.write().unwrap_or_else(|poisoned| {
            tracing::error!("state cache lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Inserts or overwrites the value of `param` for `device_id`.
    pub fn update(&self, device_id: &str, param: &str, value: &str) {
        let mut table = self.write();
        table
            .entry(device_id.to_string())
            .or_default()
            .insert(param.to_string(), value.to_string());
        tracing::debug!(
            device_id,
            param,
            value,
            devices = table.len(),
            "state cache updated"
        );
    }

    /// Returns the cached parameters of one device, empty if unknown.
    pub fn get(&self, device_id: &str) -> DeviceState {
        self.read().get(device_id).cloned().unwrap_or_default()
    }

    /// Returns a snapshot of the whole cache.
    pub fn get_all(&self) -> BTreeMap<String, DeviceState> {
        self.read()
            .iter()
            .map(|(device, state)| (device.clone(), state.clone()))
            .collect()
    }

    /// Number of devices with at least one cached value.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Decides which events are mirrored into the [`StateCache`].
///
/// An event is cached if its device is state-tracked, or if its parameter
/// is a tracked parameter. Either condition suffices.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    state_tracked: HashSet<String>,
    tracked_params: HashSet<String>,
}

impl CachePolicy {
    /// Builds the policy. `tracked_params = None` selects the built-in list.
    pub fn new(state_tracked: &[String], tracked_params: Option<&[String]>) -> Self {
        let tracked_params = match tracked_params {
            Some(params) => params.iter().map(|p| p.trim().to_string()).collect(),
            None => DEFAULT_TRACKED_PARAMS.iter().map(|p| p.to_string()).collect(),
        };
        Self {
            state_tracked: state_tracked.iter().map(|d| d.trim().to_string()).collect(),
            tracked_params,
        }
    }

    /// Whether the device is state-tracked, by full or base identifier.
    pub fn tracks_device(&self, device_id: &str) -> bool {
        self.state_tracked.contains(device_id)
            || self.state_tracked.contains(base_device_id(device_id))
    }

    pub fn tracks_param(&self, param: &str) -> bool {
        self.tracked_params.contains(param)
    }

    pub fn should_cache(&self, event: &DeviceEvent) -> bool {
        self.tracks_device(&event.device_id) || self.tracks_param(&event.param)
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(&[], None)
    }
}
