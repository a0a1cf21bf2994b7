//! Logical property identifiers (pids) and their protocol mapping
//!
//! The full device taxonomy lives in the registry layer; this table carries
//! only what the runtime engines need: logical-to-protocol id translation,
//! the default write session, and the auto-caching whitelist. The table is
//! static, compile-time data with a validation pass (`validate_pid_table`)
//! instead of runtime reflection.

use crate::device::SessionType;

/// Protocol-level pid number as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolPid(pub u16);

/// Logical property id exposed by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pid {
    FunctionName,
    FunctionInstance,
    CircuitId,
    SerialNumber,
    SoftwarePartNumber,
    BatteryVoltage,
    TankLevel,
    DimLevel,
    AwningPosition,
    /// Array-style pid, addressed with a raw sub-address per set point
    LevelerSetPoint,
    LevelerSetPointNames,
    /// Vendor extension with no protocol mapping on this bus generation
    VendorReserved,
}

/// One row of the static pid table.
#[derive(Debug, Clone, Copy)]
pub struct PidInfo {
    pub pid: Pid,
    pub name: &'static str,
    /// Protocol id, or `None` when the pid cannot be expressed on the wire
    pub protocol: Option<ProtocolPid>,
    /// Session required for writes; `SessionType::None` means read-only
    pub write_session: SessionType,
    /// Whether a snapshot-cache seed may back-fill this pid before the
    /// first live read
    pub auto_caching: bool,
}

/// Static pid table. Auto-caching covers the leveler set-point block
/// (protocol 345..=360) plus the set-point names pid.
pub static PID_TABLE: &[PidInfo] = &[
    PidInfo {
        pid: Pid::FunctionName,
        name: "function-name",
        protocol: Some(ProtocolPid(2)),
        write_session: SessionType::Diagnostic,
        auto_caching: false,
    },
    PidInfo {
        pid: Pid::FunctionInstance,
        name: "function-instance",
        protocol: Some(ProtocolPid(3)),
        write_session: SessionType::Diagnostic,
        auto_caching: false,
    },
    PidInfo {
        pid: Pid::CircuitId,
        name: "circuit-id",
        protocol: Some(ProtocolPid(4)),
        write_session: SessionType::Diagnostic,
        auto_caching: false,
    },
    PidInfo {
        pid: Pid::SerialNumber,
        name: "serial-number",
        protocol: Some(ProtocolPid(5)),
        write_session: SessionType::Manufacturing,
        auto_caching: false,
    },
    PidInfo {
        pid: Pid::SoftwarePartNumber,
        name: "software-part-number",
        protocol: Some(ProtocolPid(10)),
        write_session: SessionType::None,
        auto_caching: false,
    },
    PidInfo {
        pid: Pid::BatteryVoltage,
        name: "battery-voltage",
        protocol: Some(ProtocolPid(112)),
        write_session: SessionType::None,
        auto_caching: false,
    },
    PidInfo {
        pid: Pid::TankLevel,
        name: "tank-level",
        protocol: Some(ProtocolPid(120)),
        write_session: SessionType::None,
        auto_caching: false,
    },
    PidInfo {
        pid: Pid::DimLevel,
        name: "dim-level",
        protocol: Some(ProtocolPid(130)),
        write_session: SessionType::RemoteControl,
        auto_caching: false,
    },
    PidInfo {
        pid: Pid::AwningPosition,
        name: "awning-position",
        protocol: Some(ProtocolPid(140)),
        write_session: SessionType::None,
        auto_caching: false,
    },
    PidInfo {
        pid: Pid::LevelerSetPoint,
        name: "leveler-set-point",
        protocol: Some(ProtocolPid(345)),
        write_session: SessionType::Diagnostic,
        auto_caching: true,
    },
    PidInfo {
        pid: Pid::LevelerSetPointNames,
        name: "leveler-set-point-names",
        protocol: Some(ProtocolPid(361)),
        write_session: SessionType::Diagnostic,
        auto_caching: true,
    },
    PidInfo {
        pid: Pid::VendorReserved,
        name: "vendor-reserved",
        protocol: None,
        write_session: SessionType::None,
        auto_caching: false,
    },
];

impl Pid {
    pub fn info(&self) -> &'static PidInfo {
        // The validation pass guarantees every variant has exactly one row.
        PID_TABLE
            .iter()
            .find(|row| row.pid == *self)
            .expect("pid missing from PID_TABLE")
    }

    pub fn name(&self) -> &'static str {
        self.info().name
    }

    /// Translate to the wire-level pid; `None` means the pid cannot be
    /// read or written on this bus generation.
    pub fn protocol_id(&self) -> Option<ProtocolPid> {
        self.info().protocol
    }

    pub fn is_auto_caching(&self) -> bool {
        self.info().auto_caching
    }

    pub fn default_write_session(&self) -> SessionType {
        self.info().write_session
    }
}

/// Consistency check over the static table: no duplicate logical or
/// protocol ids, and auto-caching rows must be wire-addressable.
pub fn validate_pid_table() -> Result<(), String> {
    for (i, row) in PID_TABLE.iter().enumerate() {
        for other in &PID_TABLE[i + 1..] {
            if row.pid == other.pid {
                return Err(format!("duplicate pid table row: {}", row.name));
            }
            if row.protocol.is_some() && row.protocol == other.protocol {
                return Err(format!(
                    "protocol id {:?} shared by {} and {}",
                    row.protocol, row.name, other.name
                ));
            }
        }
        if row.auto_caching && row.protocol.is_none() {
            return Err(format!("auto-caching pid {} has no protocol id", row.name));
        }
    }
    Ok(())
}
