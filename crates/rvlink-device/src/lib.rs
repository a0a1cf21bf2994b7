//! rvlink-device - device command & property synchronization engines
//!
//! The four runtime subsystems of the SDK, all coordinating concurrent
//! callers against one serialized, session-scoped transport:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ GatewayLocator     UDP beacon discovery of CAN-to-Ethernet   │
//! │                    bridges (receive loop + expiry sweep)     │
//! │                                                              │
//! │ DevicePid          cached / single-flight / debounced pid    │
//! │   ├ CachedValue    tri-state cache with optimistic writes    │
//! │   └ SlotWriter     single-pending-value write coalescer      │
//! │                                                              │
//! │ CircuitIdWriter    zero-debounce SlotWriter specialization   │
//! │                                                              │
//! │ CommandRunner      session-gated queued/running command      │
//! │                    state machine with retry and coalescing   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Collaborators (`PidTransport`, `SessionController`, `SnapshotCache`,
//! `DeviceHandle`) are injected; see `rvlink-core`.

pub mod cache;
pub mod circuit;
pub mod command;
pub mod config;
pub mod locator;
pub mod mock;
pub mod pid;
pub mod slot;

pub use cache::{CacheState, CachedValue, UpdateOp};
pub use circuit::{CircuitId, CircuitIdWriter};
pub use command::{
    CommandControl, CommandPacket, CommandPoll, CommandResult, CommandRunner, CommandSendOptions,
    PendingCommand, MAX_COMMAND_PAYLOAD,
};
pub use config::{CommandConfig, LocatorConfig, PidConfig};
pub use locator::{GatewayEvent, GatewayLocator, GatewayRecord};
pub use pid::{DevicePid, PidBuilder, ValidityCheck};
pub use slot::{PendingOutcome, SlotDispatch, SlotError, SlotWriter, WriteOutcome};

// Re-export for convenience
pub use rvlink_core::{
    ActiveConnection, DeviceHandle, DeviceRef, DeviceType, Pid, PidError, PidTransport,
    ProtocolPid, SessionController, SessionError, SessionType, SnapshotCache, TransportError,
};
