//! Mock collaborators for testing
//!
//! Hand-written fakes for the transport, session manager, snapshot cache,
//! and device handle. Used by the unit tests here and by the integration
//! tests in `rvlink-tests`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use rvlink_core::{
    ActiveConnection, DeviceHandle, DeviceRef, DeviceType, Pid, PidTransport, ProtocolPid,
    SessionController, SessionError, SessionType, SnapshotCache, TransportError,
};

/// Mock device handle with settable connection and firmware state.
pub struct MockDeviceHandle {
    device: DeviceRef,
    connection: RwLock<ActiveConnection>,
    firmware_active: AtomicBool,
    auto_clear_lockout: bool,
    lockout_clears: AtomicUsize,
}

impl MockDeviceHandle {
    pub fn new(id: &str) -> Self {
        Self::with_type(id, DeviceType(0x10))
    }

    pub fn with_type(id: &str, device_type: DeviceType) -> Self {
        Self {
            device: DeviceRef::new(id, device_type),
            connection: RwLock::new(ActiveConnection::Direct),
            firmware_active: AtomicBool::new(false),
            auto_clear_lockout: false,
            lockout_clears: AtomicUsize::new(0),
        }
    }

    pub fn with_auto_clear_lockout(mut self) -> Self {
        self.auto_clear_lockout = true;
        self
    }

    pub fn set_connection(&self, connection: ActiveConnection) {
        *self.connection.write() = connection;
    }

    pub fn set_firmware_update_active(&self, active: bool) {
        self.firmware_active.store(active, Ordering::SeqCst);
    }

    pub fn lockout_clears(&self) -> usize {
        self.lockout_clears.load(Ordering::SeqCst)
    }
}

impl DeviceHandle for MockDeviceHandle {
    fn device_ref(&self) -> &DeviceRef {
        &self.device
    }

    fn active_connection(&self) -> ActiveConnection {
        *self.connection.read()
    }

    fn auto_clear_transit_lockout(&self) -> bool {
        self.auto_clear_lockout
    }

    fn clear_transit_lockout(&self) {
        self.lockout_clears.fetch_add(1, Ordering::SeqCst);
    }

    fn firmware_update_active(&self) -> bool {
        self.firmware_active.load(Ordering::SeqCst)
    }
}

/// Mock pid transport with scripted values, latency, and failure injection.
pub struct MockPidTransport {
    values: RwLock<HashMap<(String, u16, Option<u16>), u64>>,
    latency: RwLock<Duration>,
    read_error: RwLock<Option<TransportError>>,
    write_error: RwLock<Option<TransportError>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    accept_raw: AtomicBool,
    raw_commands: Mutex<Vec<(u8, Vec<u8>)>>,
}

impl Default for MockPidTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPidTransport {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            latency: RwLock::new(Duration::ZERO),
            read_error: RwLock::new(None),
            write_error: RwLock::new(None),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            accept_raw: AtomicBool::new(true),
            raw_commands: Mutex::new(Vec::new()),
        }
    }

    pub fn set_value(&self, device: &DeviceRef, pid: ProtocolPid, sub: Option<u16>, value: u64) {
        self.values
            .write()
            .insert((device.id.clone(), pid.0, sub), value);
    }

    pub fn value(&self, device: &DeviceRef, pid: ProtocolPid, sub: Option<u16>) -> Option<u64> {
        self.values
            .read()
            .get(&(device.id.clone(), pid.0, sub))
            .copied()
    }

    /// Per-call latency, cancellable through the operation's token.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    pub fn fail_reads(&self, error: Option<TransportError>) {
        *self.read_error.write() = error;
    }

    pub fn fail_writes(&self, error: Option<TransportError>) {
        *self.write_error.write() = error;
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_accept_raw(&self, accept: bool) {
        self.accept_raw.store(accept, Ordering::SeqCst);
    }

    /// Raw command frames seen so far, oldest first.
    pub fn raw_commands(&self) -> Vec<(u8, Vec<u8>)> {
        self.raw_commands.lock().clone()
    }

    async fn simulate_latency(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let latency = *self.latency.read();
        if latency.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Canceled),
            _ = tokio::time::sleep(latency) => Ok(()),
        }
    }
}

#[async_trait]
impl PidTransport for MockPidTransport {
    async fn read_pid(
        &self,
        device: &DeviceRef,
        pid: ProtocolPid,
        sub_address: Option<u16>,
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency(cancel).await?;
        if let Some(error) = self.read_error.read().clone() {
            return Err(error);
        }
        self.value(device, pid, sub_address)
            .ok_or_else(|| TransportError::ReceiveFailed("no scripted value".to_string()))
    }

    async fn write_pid(
        &self,
        device: &DeviceRef,
        pid: ProtocolPid,
        sub_address: Option<u16>,
        value: u64,
        _session: SessionType,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency(cancel).await?;
        if let Some(error) = self.write_error.read().clone() {
            return Err(error);
        }
        self.set_value(device, pid, sub_address, value);
        Ok(())
    }

    fn send_raw_command(&self, _device: &DeviceRef, command_byte: u8, payload: &[u8]) -> bool {
        if !self.accept_raw.load(Ordering::SeqCst) {
            return false;
        }
        self.raw_commands
            .lock()
            .push((command_byte, payload.to_vec()));
        true
    }
}

/// Mock session controller with a scriptable activation outcome.
pub struct MockSessionController {
    activation_error: RwLock<Option<SessionError>>,
    scripted_errors: Mutex<VecDeque<SessionError>>,
    activation_latency: RwLock<Duration>,
    activations: AtomicUsize,
    deactivations: Mutex<Vec<(SessionType, bool)>>,
    active: AtomicBool,
}

impl Default for MockSessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSessionController {
    pub fn new() -> Self {
        Self {
            activation_error: RwLock::new(None),
            scripted_errors: Mutex::new(VecDeque::new()),
            activation_latency: RwLock::new(Duration::ZERO),
            activations: AtomicUsize::new(0),
            deactivations: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
        }
    }

    /// Per-activation latency, cancellable through the caller's token.
    pub fn set_activation_latency(&self, latency: Duration) {
        *self.activation_latency.write() = latency;
    }

    pub fn fail_activation(&self, error: Option<SessionError>) {
        *self.activation_error.write() = error;
    }

    /// Queue a one-shot activation failure; consumed before the persistent
    /// `fail_activation` setting is consulted.
    pub fn queue_activation_error(&self, error: SessionError) {
        self.scripted_errors.lock().push_back(error);
    }

    pub fn activation_count(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn deactivations(&self) -> Vec<(SessionType, bool)> {
        self.deactivations.lock().clone()
    }
}

#[async_trait]
impl SessionController for MockSessionController {
    async fn activate(
        &self,
        _session: SessionType,
        _device: &DeviceRef,
        cancel: &CancellationToken,
        _keep_alive_ms: u32,
        _get_timeout_ms: u32,
    ) -> Result<(), SessionError> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(SessionError::Canceled);
        }
        let latency = *self.activation_latency.read();
        if !latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Canceled),
                _ = tokio::time::sleep(latency) => {}
            }
        }
        if let Some(error) = self.scripted_errors.lock().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.activation_error.read().clone() {
            return Err(error);
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn deactivate(&self, session: SessionType, _device: &DeviceRef, close_session: bool) {
        self.active.store(false, Ordering::SeqCst);
        self.deactivations.lock().push((session, close_session));
    }

    fn is_active(&self, _session: SessionType, _device: &DeviceRef) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Mock snapshot cache backing auto-caching pid seeds.
#[derive(Default)]
pub struct MockSnapshotCache {
    values: RwLock<HashMap<(String, Pid), u64>>,
}

impl MockSnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, device: &DeviceRef, pid: Pid, value: u64) {
        self.values.write().insert((device.id.clone(), pid), value);
    }
}

impl SnapshotCache for MockSnapshotCache {
    fn cached_raw_value(&self, device: &DeviceRef, pid: Pid) -> Option<u64> {
        self.values.read().get(&(device.id.clone(), pid)).copied()
    }
}
