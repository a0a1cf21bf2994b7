//! rvlink-core - shared types and collaborator traits for the rvlink SDK
//!
//! This crate defines the data model and the narrow interfaces the runtime
//! engines in `rvlink-device` are built against:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    rvlink-device                         │
//! │  GatewayLocator / DevicePid / CircuitIdWriter /          │
//! │  CommandRunner                                           │
//! │                          │                               │
//! │            ┌─────────────┼───────────────┐               │
//! │            │             │               │               │
//! │      PidTransport  SessionController  SnapshotCache      │
//! │      (read/write   (activate/         (seed values       │
//! │       pids, raw     deactivate)        only)             │
//! │       commands)                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The actual CAN/Ethernet framing and session negotiation live behind these
//! traits and are out of scope here.

pub mod device;
pub mod error;
pub mod pid;
pub mod transport;

pub use device::{ActiveConnection, DeviceHandle, DeviceRef, DeviceType, SessionType};
pub use error::{PidError, SessionError};
pub use pid::{Pid, PidInfo, ProtocolPid};
pub use transport::{PidTransport, SessionController, SnapshotCache, TransportError};
