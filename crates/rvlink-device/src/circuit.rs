//! Circuit-id assignment
//!
//! Assigning a circuit id is a plain pid write with one twist: installers
//! click through candidate ids faster than the bus can confirm them, so the
//! writer keeps at most one pending assignment and preempts the rest. No
//! debounce window; the newest id goes out as soon as the worker is free.
//!
//! The observable value is updated optimistically the moment an assignment
//! is queued, so the UI tracks the installer's clicks instead of the bus.
//! The previous observable value stays available as `last_value`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use rvlink_core::{DeviceHandle, Pid, PidError, PidTransport};

use crate::config::PidConfig;
use crate::pid::DevicePid;
use crate::slot::{PendingOutcome, SlotDispatch, SlotError, SlotWriter, WriteOutcome};

/// Wiring-harness circuit identifier as configured on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitId(pub u16);

impl CircuitId {
    /// Factory value on devices that were never assigned a circuit.
    pub const UNASSIGNED: CircuitId = CircuitId(0);

    pub fn from_raw(raw: u64) -> Self {
        CircuitId(raw as u16)
    }

    pub fn raw(self) -> u64 {
        u64::from(self.0)
    }

    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }
}

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circuit-{}", self.0)
    }
}

struct CircuitIdDispatch {
    pid: Arc<DevicePid>,
}

#[async_trait]
impl SlotDispatch<CircuitId> for CircuitIdDispatch {
    async fn dispatch(&self, id: CircuitId, cancel: &CancellationToken) -> Result<(), SlotError> {
        match self.pid.write_value(id.raw(), cancel).await {
            Ok(()) => {
                info!(circuit = %id, "circuit id written");
                Ok(())
            }
            Err(PidError::Canceled) => Err(SlotError::Canceled),
            Err(e) => Err(SlotError::Failed(e.to_string())),
        }
    }
}

/// Externally observable id, updated optimistically at assignment time.
struct Observed {
    value: CircuitId,
    /// Previous observable value before the last change
    last_value: CircuitId,
    loaded: bool,
}

/// Single-slot writer for the circuit-id pid.
pub struct CircuitIdWriter {
    pid: Arc<DevicePid>,
    slot: SlotWriter<CircuitId>,
    observed: Mutex<Observed>,
}

impl CircuitIdWriter {
    pub fn new(device: Arc<dyn DeviceHandle>, transport: Arc<dyn PidTransport>) -> Self {
        Self::with_config(device, transport, PidConfig::default())
    }

    pub fn with_config(
        device: Arc<dyn DeviceHandle>,
        transport: Arc<dyn PidTransport>,
        config: PidConfig,
    ) -> Self {
        let pid = DevicePid::builder(device, Pid::CircuitId)
            .transport(transport)
            .config(config)
            .build();
        let slot = SlotWriter::new(
            "circuit-id",
            std::time::Duration::ZERO,
            Arc::new(CircuitIdDispatch { pid: pid.clone() }),
        );
        Self {
            pid,
            slot,
            observed: Mutex::new(Observed {
                value: CircuitId::UNASSIGNED,
                last_value: CircuitId::UNASSIGNED,
                loaded: false,
            }),
        }
    }

    fn set_observed(&self, id: CircuitId) {
        let mut observed = self.observed.lock();
        observed.loaded = true;
        if observed.value != id {
            observed.last_value = observed.value;
            observed.value = id;
        }
    }

    /// Queue an assignment, displacing any not-yet-transmitted predecessor.
    /// The observable value takes `id` immediately, before the network write
    /// is confirmed. The returned handle resolves when this particular
    /// assignment reaches a terminal outcome.
    pub fn assign(&self, id: CircuitId, cancel: CancellationToken) -> PendingOutcome {
        self.set_observed(id);
        self.slot.submit(id, cancel)
    }

    /// Queue an assignment and wait for its terminal outcome.
    pub async fn assign_and_wait(&self, id: CircuitId, cancel: CancellationToken) -> WriteOutcome {
        self.assign(id, cancel).outcome().await
    }

    /// Read the id currently configured on the device.
    pub async fn read(&self, cancel: &CancellationToken) -> Result<CircuitId, PidError> {
        let id = self
            .pid
            .read_value(cancel, false)
            .await
            .map(CircuitId::from_raw)?;
        if !self.slot.is_writing() {
            self.set_observed(id);
        }
        Ok(id)
    }

    /// Observable id: the most recently assigned or confirmed value.
    pub fn current(&self) -> CircuitId {
        self.observed.lock().value
    }

    /// The observable value before the last change.
    pub fn last_value(&self) -> CircuitId {
        self.observed.lock().last_value
    }

    /// True once any id has been assigned or confirmed.
    pub fn is_loaded(&self) -> bool {
        self.observed.lock().loaded
    }

    /// Apply an id observed outside this writer (broadcast status frame).
    /// Ignored while a local assignment is being transmitted so the
    /// in-flight write stays authoritative.
    pub fn update_value(&self, id: CircuitId) {
        if self.slot.is_writing() {
            return;
        }
        self.set_observed(id);
        self.pid.apply_confirmed_value(id.raw());
    }

    pub fn is_writing(&self) -> bool {
        self.slot.is_writing()
    }

    pub fn dispose(&self) {
        self.slot.dispose();
        self.pid.dispose();
    }
}
