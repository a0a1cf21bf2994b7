//! Error taxonomy shared by the runtime engines
//!
//! Both enums are `Clone`: one outcome frequently fans out to several
//! waiters (batched reads) or is recorded next to a coordination result.

use thiserror::Error;

use crate::pid::Pid;

/// Errors surfaced by pid reads and writes.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PidError {
    /// No transport provider is attached for this device
    #[error("pid {0:?} read not supported (no transport provider)")]
    ReadNotSupported(Pid),

    #[error("pid {0:?} write not supported (no transport provider)")]
    WriteNotSupported(Pid),

    /// The pid is configured without a write session
    #[error("pid {0:?} is read-only")]
    ReadOnly(Pid),

    /// Logical pid could not be translated or the wire exchange broke protocol
    #[error("protocol error for pid {pid:?}: {message}")]
    Protocol { pid: Pid, message: String },

    /// Raw value rejected by the injected validity predicate
    #[error("invalid value {value} for pid {pid:?}")]
    InvalidValue { pid: Pid, value: u64 },

    /// A firmware-update session owns the bus right now
    #[error("pid operation rejected: firmware update in progress")]
    FirmwareUpdateInProgress,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("pid operation timed out")]
    Timeout,

    #[error("pid operation canceled")]
    Canceled,
}

/// Session activation failures, classified once at the session-manager
/// boundary. The command engine maps these to `CommandResult` codes and
/// never retries them itself.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("device offline")]
    DeviceOffline,

    #[error("session acquisition timed out")]
    Timeout,

    /// Safety lockout while the vehicle is in motion
    #[error("in-transit lockout enforced")]
    InTransitLockout,

    #[error("device not currently accepting commands")]
    NotAcceptingCommands,

    /// Another controller already holds the remote session; harmless for
    /// command dispatch
    #[error("remote session already active")]
    RemoteSessionActive,

    /// Sessions administratively disabled; harmless for command dispatch
    #[error("sessions disabled")]
    SessionsDisabled,

    #[error("no session manager available")]
    NotAvailable,

    #[error("session activation canceled")]
    Canceled,

    #[error("session error: {0}")]
    Other(String),
}

impl SessionError {
    /// Outcomes that do not prevent sending a command: the session is
    /// effectively usable even though activation reported a condition.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            SessionError::RemoteSessionActive | SessionError::SessionsDisabled
        )
    }
}
