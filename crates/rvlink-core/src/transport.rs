//! Collaborator traits consumed by the runtime engines
//!
//! These are the narrow seams to the low-level transport stack. The engines
//! never see CAN frames or session negotiation; they see typed pid values,
//! an accepted/rejected flag for raw commands, and session activation
//! results classified as [`SessionError`].

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::device::{DeviceRef, SessionType};
use crate::error::SessionError;
use crate::pid::{Pid, ProtocolPid};

/// Transport-agnostic pid and raw-command access for one bus connection.
#[async_trait]
pub trait PidTransport: Send + Sync {
    /// Read a pid value, optionally addressed into an array-style pid
    /// via `sub_address`.
    async fn read_pid(
        &self,
        device: &DeviceRef,
        pid: ProtocolPid,
        sub_address: Option<u16>,
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError>;

    /// Write a pid value under the given session type.
    async fn write_pid(
        &self,
        device: &DeviceRef,
        pid: ProtocolPid,
        sub_address: Option<u16>,
        value: u64,
        session: SessionType,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    /// Queue a raw command frame for transmission. Returns whether the
    /// adapter accepted it; delivery is not confirmed at this layer.
    fn send_raw_command(&self, device: &DeviceRef, command_byte: u8, payload: &[u8]) -> bool;
}

/// Transport-level failures as seen by the engines.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TransportError {
    #[error("device offline")]
    DeviceOffline,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("transport timeout")]
    Timeout,

    #[error("operation canceled")]
    Canceled,
}

/// Session lifecycle control for a device.
#[async_trait]
pub trait SessionController: Send + Sync {
    /// Activate (or extend) a session of the given type. `keep_alive_ms`
    /// of zero means the transport default.
    async fn activate(
        &self,
        session: SessionType,
        device: &DeviceRef,
        cancel: &CancellationToken,
        keep_alive_ms: u32,
        get_timeout_ms: u32,
    ) -> Result<(), SessionError>;

    /// Drop the engine's claim on a session; `close_session` asks the
    /// transport to tear it down on the wire as well.
    fn deactivate(&self, session: SessionType, device: &DeviceRef, close_session: bool);

    fn is_active(&self, session: SessionType, device: &DeviceRef) -> bool;
}

/// Snapshot-backed seed values for auto-caching pids.
///
/// Only ever used to seed a pid cache before the first live read; a seeded
/// value is immediately marked stale and never treated as authoritative.
pub trait SnapshotCache: Send + Sync {
    fn cached_raw_value(&self, device: &DeviceRef, pid: Pid) -> Option<u64>;
}
