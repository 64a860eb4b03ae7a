//! Shared types and constants for the hmbridge workspace.
//!
//! This crate holds the canonical event record delivered by the CCU, the
//! channel-suffix convention for device identifiers, and the closed set of
//! RPC methods the listener answers. Every other crate depends on it for
//! these definitions so the base-identifier derivation exists in one place.

/// Parameter whose changes trigger an outbound transition notification.
pub const TRIGGER_PARAM: &str = "WINDOW_STATE";

/// Parameters mirrored into the state cache when no override is configured.
pub const DEFAULT_TRACKED_PARAMS: &[&str] = &[
    "WINDOW_STATE",
    "OPERATING_VOLTAGE",
    "SET_POINT_TEMPERATURE",
    "ACTUAL_TEMPERATURE",
    "LEVEL",
    "BOOST_MODE",
    "ACTIVE_PROFILE",
];

/// Number of positional arguments that make up a complete event.
pub const EVENT_ARITY: usize = 4;

/// Returns the physical device identity of a possibly channel-qualified ID.
///
/// `"ABC123:1"` yields `"ABC123"`; an ID without `:` is returned unchanged.
pub fn base_device_id(device_id: &str) -> &str {
    match device_id.split_once(':') {
        Some((base, _)) => base,
        None => device_id,
    }
}

/// A complete device event as delivered by the CCU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    /// CCU interface identifier the event arrived through (e.g. `HmIP-RF`).
    pub interface: String,
    /// Channel-qualified device identifier (`BASE:CHANNEL`).
    pub device_id: String,
    /// Parameter name (e.g. `LEVEL`).
    pub param: String,
    /// Textual parameter value.
    pub value: String,
}

impl DeviceEvent {
    /// Returns the physical device identity of this event's device.
    pub fn base_device_id(&self) -> &str {
        base_device_id(&self.device_id)
    }
}

/// A normalized call whose fields are populated positionally.
///
/// Positions the caller did not send stay `None`. Only a record with all four
/// fields can be turned into a [`DeviceEvent`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialEvent {
    pub interface: Option<String>,
    pub device_id: Option<String>,
    pub param: Option<String>,
    pub value: Option<String>,
}

impl PartialEvent {
    /// Number of fields that were populated.
    pub fn len(&self) -> usize {
        [
            &self.interface,
            &self.device_id,
            &self.param,
            &self.value,
        ]
        .iter()
        .filter(|field| field.is_some())
        .count()
    }

    /// Returns `true` if no positional argument was received.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the full event if every field is present.
    pub fn complete(&self) -> Option<DeviceEvent> {
        Some(DeviceEvent {
            interface: self.interface.clone()?,
            device_id: self.device_id.clone()?,
            param: self.param.clone()?,
            value: self.value.clone()?,
        })
    }
}

impl From<DeviceEvent> for PartialEvent {
    fn from(event: DeviceEvent) -> Self {
        Self {
            interface: Some(event.interface),
            device_id: Some(event.device_id),
            param: Some(event.param),
            value: Some(event.value),
        }
    }
}

/// The RPC methods the CCU may invoke on the callback listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    /// A single parameter change.
    Event,
    /// A device was added on the CCU.
    NewDevice,
    /// Discovery request; answered with an empty device list.
    ListDevices,
    /// Bulk device description push. Deliberately not processed.
    NewDevices,
    /// Introspection request (`listMethods` or `system.listMethods`).
    ListMethods,
    /// Configuration-ready callback.
    SetReadyConfig,
    /// Batched calls (`system.multicall`).
    Multicall,
    /// Returns the cached state of one device.
    GetDeviceStates,
    /// Returns the whole state cache.
    GetAllDeviceStates,
}

impl RpcMethod {
    /// Resolves a wire method name.
    pub fn from_name(name: &str) -> Result<Self, UnknownMethodError> {
        match name {
            "event" => Ok(Self::Event),
            "newDevice" => Ok(Self::NewDevice),
            "listDevices" => Ok(Self::ListDevices),
            "newDevices" => Ok(Self::NewDevices),
            "listMethods" | "system.listMethods" => Ok(Self::ListMethods),
            "setReadyConfig" => Ok(Self::SetReadyConfig),
            "system.multicall" => Ok(Self::Multicall),
            "getDeviceStates" => Ok(Self::GetDeviceStates),
            "getAllDeviceStates" => Ok(Self::GetAllDeviceStates),
            other => Err(UnknownMethodError(other.to_string())),
        }
    }

    /// Returns the canonical wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::NewDevice => "newDevice",
            Self::ListDevices => "listDevices",
            Self::NewDevices => "newDevices",
            Self::ListMethods => "listMethods",
            Self::SetReadyConfig => "setReadyConfig",
            Self::Multicall => "system.multicall",
            Self::GetDeviceStates => "getDeviceStates",
            Self::GetAllDeviceStates => "getAllDeviceStates",
        }
    }

    /// Whether calls of this method run through the event pipeline.
    pub fn runs_pipeline(self) -> bool {
        matches!(
            self,
            Self::Event
                | Self::NewDevice
                | Self::ListDevices
                | Self::ListMethods
                | Self::SetReadyConfig
        )
    }
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a method name is not part of [`RpcMethod`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("method not supported: {0}")]
pub struct UnknownMethodError(pub String);
