//! Logical device identity and runtime state

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a logical device is currently reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveConnection {
    /// Not reachable at all
    Offline,
    /// Reachable over the local CAN bus (directly or via an Ethernet bridge)
    Direct,
    /// Reachable only through a cloud/remote relay; commands are not allowed
    Remote,
}

/// Session kinds a device accepts before honoring writes or commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionType {
    /// No session required (read-only access)
    None,
    RemoteControl,
    Diagnostic,
    Manufacturing,
}

/// Device class byte from the bus-level device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceType(pub u8);

impl DeviceType {
    /// CAN-to-Ethernet gateway class. Gateways stay reachable while they
    /// drive a firmware update, so pid/command traffic to them is never
    /// blocked by the firmware-update gate.
    pub const GATEWAY: DeviceType = DeviceType(50);

    pub fn firmware_gate_exempt(&self) -> bool {
        *self == Self::GATEWAY
    }
}

/// Identity of one addressable function on the bus.
///
/// Equality/hash is the full identity: the engines key per-device state
/// (pid caches, command slots) on this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    /// Stable identifier assigned by the device registry
    pub id: String,
    pub device_type: DeviceType,
}

impl DeviceRef {
    pub fn new(id: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            id: id.into(),
            device_type,
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (type 0x{:02X})", self.id, self.device_type.0)
    }
}

/// Runtime view of one logical device, owned by the device registry.
///
/// The engines only consume state through this trait; the registry itself
/// (enumeration, tags, snapshots) is an external collaborator.
pub trait DeviceHandle: Send + Sync {
    fn device_ref(&self) -> &DeviceRef;

    fn active_connection(&self) -> ActiveConnection;

    /// Whether commands to this device must be preceded by clearing the
    /// in-transit lockout.
    fn auto_clear_transit_lockout(&self) -> bool {
        false
    }

    /// Fire the lockout-clearing side effect. Best-effort: callers never
    /// await it for correctness.
    fn clear_transit_lockout(&self) {}

    /// True while a firmware-update session is running somewhere on the bus
    /// and this device is not the one being updated.
    fn firmware_update_active(&self) -> bool {
        false
    }
}
