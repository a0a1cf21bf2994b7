//! Per-(device, pid) property synchronization engine
//!
//! `DevicePid` combines three layers around one pid:
//! - a tri-state [`CachedValue`] with a freshness TTL,
//! - a single-flight batched reader: concurrent `read_value` callers share
//!   one network read and all observe its outcome,
//! - a debounced setter backed by [`SlotWriter`] so rapid UI-driven changes
//!   coalesce into one write carrying the final value.
//!
//! Writes are optimistic write-through: the new value is visible to
//! `current_value` while the network write runs, committed on success and
//! rolled back on failure. Failures never poison the cache.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use rvlink_core::{
    DeviceHandle, Pid, PidError, PidTransport, SessionType, SnapshotCache,
    TransportError,
};

use crate::cache::{CacheState, CachedValue};
use crate::config::PidConfig;
use crate::slot::{SlotDispatch, SlotError, SlotWriter};

/// Injected predicate rejecting raw values the device reports but the
/// function cannot actually take (sensor fault markers and the like).
pub type ValidityCheck = Arc<dyn Fn(u64) -> bool + Send + Sync>;

struct ReaderState {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<Result<u64, PidError>>>,
}

pub struct DevicePid {
    device: Arc<dyn DeviceHandle>,
    pid: Pid,
    sub_address: Option<u16>,
    write_session: SessionType,
    validity_read: Option<ValidityCheck>,
    validity_write: Option<ValidityCheck>,
    config: PidConfig,
    transport: RwLock<Option<Arc<dyn PidTransport>>>,
    snapshot: Option<Arc<dyn SnapshotCache>>,
    cache: CachedValue<u64>,
    reader: Mutex<ReaderState>,
    debounce: SlotWriter<u64>,
    shutdown: CancellationToken,
}

/// Builder for [`DevicePid`]; `build` wires the debounced setter back to
/// the engine, so the result is always an `Arc`.
pub struct PidBuilder {
    device: Arc<dyn DeviceHandle>,
    pid: Pid,
    sub_address: Option<u16>,
    write_session: SessionType,
    validity_read: Option<ValidityCheck>,
    validity_write: Option<ValidityCheck>,
    config: PidConfig,
    transport: Option<Arc<dyn PidTransport>>,
    snapshot: Option<Arc<dyn SnapshotCache>>,
}

impl PidBuilder {
    pub fn sub_address(mut self, sub_address: u16) -> Self {
        self.sub_address = Some(sub_address);
        self
    }

    /// Override the pid table's default write session.
    /// `SessionType::None` makes the pid read-only.
    pub fn write_session(mut self, session: SessionType) -> Self {
        self.write_session = session;
        self
    }

    /// One predicate for both directions, like most scalar pids use.
    pub fn validity_check(mut self, check: ValidityCheck) -> Self {
        self.validity_read = Some(check.clone());
        self.validity_write = Some(check);
        self
    }

    pub fn validity_check_read(mut self, check: ValidityCheck) -> Self {
        self.validity_read = Some(check);
        self
    }

    pub fn validity_check_write(mut self, check: ValidityCheck) -> Self {
        self.validity_write = Some(check);
        self
    }

    pub fn config(mut self, config: PidConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn PidTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn snapshot_cache(mut self, snapshot: Arc<dyn SnapshotCache>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn build(self) -> Arc<DevicePid> {
        let cache_ttl = Duration::from_millis(self.config.cache_ttl_ms);
        let debounce = Duration::from_millis(self.config.write_debounce_ms);
        Arc::new_cyclic(|weak: &Weak<DevicePid>| DevicePid {
            device: self.device,
            pid: self.pid,
            sub_address: self.sub_address,
            write_session: self.write_session,
            validity_read: self.validity_read,
            validity_write: self.validity_write,
            config: self.config,
            transport: RwLock::new(self.transport),
            snapshot: self.snapshot,
            cache: CachedValue::new(cache_ttl),
            reader: Mutex::new(ReaderState {
                in_flight: false,
                waiters: Vec::new(),
            }),
            debounce: SlotWriter::new(
                "pid-debounce",
                debounce,
                Arc::new(DebouncedPidWrite { pid: weak.clone() }),
            ),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Slot dispatch feeding the debounced setter into `write_value`.
struct DebouncedPidWrite {
    pid: Weak<DevicePid>,
}

#[async_trait]
impl SlotDispatch<u64> for DebouncedPidWrite {
    async fn dispatch(&self, value: u64, cancel: &CancellationToken) -> Result<(), SlotError> {
        let Some(pid) = self.pid.upgrade() else {
            return Err(SlotError::Canceled);
        };
        match pid.write_value(value, cancel).await {
            Ok(()) => Ok(()),
            Err(PidError::Canceled) => Err(SlotError::Canceled),
            Err(e) => Err(SlotError::Failed(e.to_string())),
        }
    }
}

impl DevicePid {
    pub fn builder(device: Arc<dyn DeviceHandle>, pid: Pid) -> PidBuilder {
        PidBuilder {
            device,
            pid,
            sub_address: None,
            write_session: pid.default_write_session(),
            validity_read: None,
            validity_write: None,
            config: PidConfig::default(),
            transport: None,
            snapshot: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_read_only(&self) -> bool {
        self.write_session == SessionType::None
    }

    pub fn cache_state(&self) -> CacheState {
        self.cache.state()
    }

    pub fn attach_transport(&self, transport: Arc<dyn PidTransport>) {
        *self.transport.write() = Some(transport);
    }

    pub fn detach_transport(&self) {
        *self.transport.write() = None;
    }

    /// Non-blocking accessor for UI-style polling reads. Never performs
    /// I/O inline; stale or missing entries fire a background refresh and
    /// the best currently-known value is returned immediately.
    pub fn current_value(self: &Arc<Self>) -> u64 {
        let (value, state) = self.cache.value_and_state();
        match state {
            CacheState::NoValue => {
                let mut available = value;
                if self.pid.is_auto_caching() {
                    if let Some(snapshot) = &self.snapshot {
                        if let Some(seed) =
                            snapshot.cached_raw_value(self.device.device_ref(), self.pid)
                        {
                            // Seeds are never authoritative.
                            self.cache.set(seed);
                            self.cache.invalidate();
                            available = seed;
                        }
                    }
                }
                self.spawn_background_refresh();
                available
            }
            CacheState::StaleNeedsRefresh => {
                self.spawn_background_refresh();
                value
            }
            CacheState::Fresh | CacheState::Updating => value,
        }
    }

    fn spawn_background_refresh(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = this.shutdown.child_token();
            if let Err(e) = this.read_value(&cancel, false).await {
                debug!(pid = ?this.pid, error = %e, "background refresh failed");
            }
        });
    }

    /// Read the pid, deduplicating concurrent callers: while a read is in
    /// flight every caller joins it and observes the same outcome.
    /// `force_refresh` bypasses a still-fresh cache.
    pub async fn read_value(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        force_refresh: bool,
    ) -> Result<u64, PidError> {
        if !force_refresh {
            let (value, state) = self.cache.value_and_state();
            if matches!(state, CacheState::Fresh | CacheState::Updating) {
                return Ok(value);
            }
        }

        let (tx, rx) = oneshot::channel();
        let starts_read = {
            let mut reader = self.reader.lock();
            reader.waiters.push(tx);
            if reader.in_flight {
                false
            } else {
                reader.in_flight = true;
                true
            }
        };

        if starts_read {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let result = this.read_once().await;
                if let Ok(value) = &result {
                    this.cache.set(*value);
                }
                let waiters = {
                    let mut reader = this.reader.lock();
                    reader.in_flight = false;
                    std::mem::take(&mut reader.waiters)
                };
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(PidError::Canceled),
            result = rx => result.unwrap_or(Err(PidError::Canceled)),
        }
    }

    /// One network read attempt. Runs under the engine's own token so an
    /// individual caller canceling never aborts the shared read.
    async fn read_once(&self) -> Result<u64, PidError> {
        self.ensure_operation_allowed()?;
        let transport = self
            .transport
            .read()
            .clone()
            .ok_or(PidError::ReadNotSupported(self.pid))?;
        let protocol = self.pid.protocol_id().ok_or_else(|| PidError::Protocol {
            pid: self.pid,
            message: "no protocol mapping".to_string(),
        })?;

        let token = self.shutdown.child_token();
        let read = transport.read_pid(self.device.device_ref(), protocol, self.sub_address, &token);
        let value = match tokio::time::timeout(
            Duration::from_millis(self.config.read_timeout_ms),
            read,
        )
        .await
        {
            Err(_) => return Err(PidError::Timeout),
            Ok(Err(e)) => return Err(map_transport_error(e)),
            Ok(Ok(value)) => value,
        };

        if let Some(check) = &self.validity_read {
            if !check(value) {
                return Err(PidError::InvalidValue {
                    pid: self.pid,
                    value,
                });
            }
        }
        Ok(value)
    }

    /// Write the pid with optimistic write-through. On failure the cache
    /// rolls back to the value it held before the call.
    pub async fn write_value(&self, value: u64, cancel: &CancellationToken) -> Result<(), PidError> {
        if self.is_read_only() {
            return Err(PidError::ReadOnly(self.pid));
        }
        self.ensure_operation_allowed()?;
        if let Some(check) = &self.validity_write {
            if !check(value) {
                return Err(PidError::InvalidValue {
                    pid: self.pid,
                    value,
                });
            }
        }

        let op = self.cache.begin_update(value);
        match self.write_once(value, cancel).await {
            Ok(()) => {
                // A read confirming a different value raced the write; the
                // entry cannot be trusted as fresh.
                if let Some(concurrent) = self.cache.commit_update(op) {
                    if concurrent != value {
                        self.cache.invalidate();
                    }
                }
                Ok(())
            }
            Err(e) => {
                error!(pid = ?self.pid, value, error = %e, "pid write failed");
                self.cache.fail_update(op);
                Err(e)
            }
        }
    }

    async fn write_once(&self, value: u64, cancel: &CancellationToken) -> Result<(), PidError> {
        let transport = self
            .transport
            .read()
            .clone()
            .ok_or(PidError::WriteNotSupported(self.pid))?;
        let protocol = self.pid.protocol_id().ok_or_else(|| PidError::Protocol {
            pid: self.pid,
            message: "no protocol mapping".to_string(),
        })?;

        let write = transport.write_pid(
            self.device.device_ref(),
            protocol,
            self.sub_address,
            value,
            self.write_session,
            cancel,
        );
        match tokio::time::timeout(Duration::from_millis(self.config.write_timeout_ms), write)
            .await
        {
            Err(_) => Err(PidError::Timeout),
            Ok(Err(e)) => Err(map_transport_error(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Setter-style debounced write: rapid calls coalesce and only the
    /// last value is transmitted, after the debounce window. The result is
    /// intentionally not surfaced; explicit callers use `write_value`.
    pub fn set_value(&self, value: u64) {
        if self.shutdown.is_cancelled() {
            warn!(pid = ?self.pid, "debounced write ignored, engine disposed");
            return;
        }
        if self.cache.value() == value {
            return;
        }
        let _ = self.debounce.submit(value, self.shutdown.child_token());
    }

    /// Apply a value confirmed outside the engine, e.g. carried by a
    /// broadcast status frame. Restarts the freshness window; during an
    /// in-flight optimistic write it only retargets the rollback value.
    pub fn apply_confirmed_value(&self, value: u64) {
        self.cache.set(value);
    }

    /// Every read/write is rejected while a firmware update owns the bus,
    /// except for exempt device classes (the gateway driving the update).
    fn ensure_operation_allowed(&self) -> Result<(), PidError> {
        if self
            .device
            .device_ref()
            .device_type
            .firmware_gate_exempt()
        {
            return Ok(());
        }
        if self.device.firmware_update_active() {
            return Err(PidError::FirmwareUpdateInProgress);
        }
        Ok(())
    }

    /// Cancel all outstanding work; pending readers resolve `Canceled`.
    pub fn dispose(&self) {
        self.shutdown.cancel();
        self.debounce.dispose();
        let waiters = {
            let mut reader = self.reader.lock();
            std::mem::take(&mut reader.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(PidError::Canceled));
        }
    }
}

fn map_transport_error(error: TransportError) -> PidError {
    match error {
        TransportError::Timeout => PidError::Timeout,
        TransportError::Canceled => PidError::Canceled,
        other => PidError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDeviceHandle, MockPidTransport, MockSnapshotCache};
    use rvlink_core::{DeviceType, ProtocolPid};

    fn engine(
        pid: Pid,
    ) -> (
        Arc<DevicePid>,
        Arc<MockPidTransport>,
        Arc<MockDeviceHandle>,
    ) {
        let device = Arc::new(MockDeviceHandle::new("bedroom-light"));
        let transport = Arc::new(MockPidTransport::new());
        let engine = DevicePid::builder(device.clone(), pid)
            .transport(transport.clone())
            .build();
        (engine, transport, device)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_readers_share_one_network_read() {
        let (engine, transport, device) = engine(Pid::DimLevel);
        transport.set_value(device.device_ref(), ProtocolPid(130), None, 80);
        transport.set_latency(Duration::from_millis(50));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.read_value(&CancellationToken::new(), false).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(80));
        }
        assert_eq!(transport.read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cache_satisfies_reads_without_network() {
        let (engine, transport, device) = engine(Pid::DimLevel);
        transport.set_value(device.device_ref(), ProtocolPid(130), None, 80);

        let cancel = CancellationToken::new();
        assert_eq!(engine.read_value(&cancel, false).await, Ok(80));
        assert_eq!(engine.read_value(&cancel, false).await, Ok(80));
        assert_eq!(transport.read_count(), 1);

        // forceRefresh bypasses the fresh cache.
        transport.set_value(device.device_ref(), ProtocolPid(130), None, 90);
        assert_eq!(engine.read_value(&cancel, true).await, Ok(90));
        assert_eq!(transport.read_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn read_fails_without_transport() {
        let device = Arc::new(MockDeviceHandle::new("dev"));
        let engine = DevicePid::builder(device, Pid::DimLevel).build();
        let result = engine.read_value(&CancellationToken::new(), false).await;
        assert_eq!(result, Err(PidError::ReadNotSupported(Pid::DimLevel)));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_can_be_attached_and_detached() {
        let device = Arc::new(MockDeviceHandle::new("light"));
        let transport = Arc::new(MockPidTransport::new());
        transport.set_value(device.device_ref(), ProtocolPid(130), None, 12);
        let engine = DevicePid::builder(device, Pid::DimLevel).build();

        let cancel = CancellationToken::new();
        assert_eq!(
            engine.read_value(&cancel, false).await,
            Err(PidError::ReadNotSupported(Pid::DimLevel))
        );

        engine.attach_transport(transport.clone());
        assert_eq!(engine.read_value(&cancel, false).await, Ok(12));

        // Detaching drops the provider; forced reads fail again.
        engine.detach_transport();
        assert_eq!(
            engine.read_value(&cancel, true).await,
            Err(PidError::ReadNotSupported(Pid::DimLevel))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn untranslatable_pid_is_a_protocol_error() {
        let (engine, _transport, _device) = engine(Pid::VendorReserved);
        let result = engine.read_value(&CancellationToken::new(), false).await;
        assert!(matches!(result, Err(PidError::Protocol { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_read_value_leaves_cache_untouched() {
        let device = Arc::new(MockDeviceHandle::new("tank"));
        let transport = Arc::new(MockPidTransport::new());
        transport.set_value(device.device_ref(), ProtocolPid(120), None, 55);
        let engine = DevicePid::builder(device.clone(), Pid::TankLevel)
            .transport(transport.clone())
            .validity_check(Arc::new(|v| v <= 100))
            .build();

        let cancel = CancellationToken::new();
        assert_eq!(engine.read_value(&cancel, false).await, Ok(55));

        transport.set_value(device.device_ref(), ProtocolPid(120), None, 255);
        let result = engine.read_value(&cancel, true).await;
        assert_eq!(
            result,
            Err(PidError::InvalidValue {
                pid: Pid::TankLevel,
                value: 255
            })
        );
        // Prior value survives the rejected read.
        assert_eq!(engine.cache.value(), 55);
    }

    #[tokio::test(start_paused = true)]
    async fn write_invalid_value_leaves_cache_unchanged() {
        let device = Arc::new(MockDeviceHandle::new("light"));
        let transport = Arc::new(MockPidTransport::new());
        transport.set_value(device.device_ref(), ProtocolPid(130), None, 10);
        let engine = DevicePid::builder(device, Pid::DimLevel)
            .transport(transport.clone())
            .validity_check(Arc::new(|v| v <= 100))
            .build();

        let cancel = CancellationToken::new();
        assert_eq!(engine.read_value(&cancel, false).await, Ok(10));
        let before = engine.cache.value();
        let result = engine.write_value(250, &cancel).await;
        assert!(matches!(result, Err(PidError::InvalidValue { .. })));
        assert_eq!(engine.cache.value(), before);
        assert_eq!(transport.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_only_pid_rejects_writes() {
        let (engine, _transport, _device) = engine(Pid::BatteryVoltage);
        let result = engine.write_value(1, &CancellationToken::new()).await;
        assert_eq!(result, Err(PidError::ReadOnly(Pid::BatteryVoltage)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_rolls_back_optimistic_value() {
        let (engine, transport, device) = engine(Pid::DimLevel);
        transport.set_value(device.device_ref(), ProtocolPid(130), None, 10);
        let cancel = CancellationToken::new();
        assert_eq!(engine.read_value(&cancel, false).await, Ok(10));

        transport.fail_writes(Some(TransportError::SendFailed("bus off".into())));
        let result = engine.write_value(42, &cancel).await;
        assert!(matches!(result, Err(PidError::Transport(_))));
        assert_eq!(engine.cache.value(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_write_commits_and_freshens() {
        let (engine, transport, device) = engine(Pid::DimLevel);
        let cancel = CancellationToken::new();
        engine.write_value(77, &cancel).await.unwrap();
        assert_eq!(engine.cache.value(), 77);
        assert_eq!(engine.cache_state(), CacheState::Fresh);
        assert_eq!(
            transport.value(device.device_ref(), ProtocolPid(130), None),
            Some(77)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_update_blocks_reads_and_writes() {
        let (engine, _transport, device) = engine(Pid::DimLevel);
        device.set_firmware_update_active(true);
        let cancel = CancellationToken::new();
        assert_eq!(
            engine.read_value(&cancel, false).await,
            Err(PidError::FirmwareUpdateInProgress)
        );
        assert_eq!(
            engine.write_value(1, &cancel).await,
            Err(PidError::FirmwareUpdateInProgress)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_class_is_exempt_from_firmware_gate() {
        let device = Arc::new(MockDeviceHandle::with_type("bridge", DeviceType::GATEWAY));
        let transport = Arc::new(MockPidTransport::new());
        transport.set_value(device.device_ref(), ProtocolPid(130), None, 3);
        device.set_firmware_update_active(true);
        let engine = DevicePid::builder(device, Pid::DimLevel)
            .transport(transport)
            .build();
        assert_eq!(
            engine.read_value(&CancellationToken::new(), false).await,
            Ok(3)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn current_value_serves_stale_and_refreshes_in_background() {
        let (engine, transport, device) = engine(Pid::DimLevel);
        transport.set_value(device.device_ref(), ProtocolPid(130), None, 20);
        let cancel = CancellationToken::new();
        assert_eq!(engine.read_value(&cancel, false).await, Ok(20));

        tokio::time::sleep(Duration::from_millis(300)).await;
        transport.set_value(device.device_ref(), ProtocolPid(130), None, 30);

        // Stale: returns last known value immediately, refresh fires behind.
        assert_eq!(engine.current_value(), 20);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.current_value(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_caching_pid_seeds_from_snapshot_as_stale() {
        let device = Arc::new(MockDeviceHandle::new("leveler"));
        let transport = Arc::new(MockPidTransport::new());
        transport.set_value(device.device_ref(), ProtocolPid(345), None, 500);
        let snapshot = Arc::new(MockSnapshotCache::new());
        snapshot.set(device.device_ref(), Pid::LevelerSetPoint, 480);

        let engine = DevicePid::builder(device, Pid::LevelerSetPoint)
            .transport(transport)
            .snapshot_cache(snapshot)
            .build();

        // First poll returns the seed and marks it stale.
        assert_eq!(engine.current_value(), 480);
        assert_eq!(engine.cache_state(), CacheState::StaleNeedsRefresh);

        // The background refresh replaces the seed with the live value.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.current_value(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn non_auto_caching_pid_ignores_snapshot() {
        let device = Arc::new(MockDeviceHandle::new("light"));
        let transport = Arc::new(MockPidTransport::new());
        transport.set_value(device.device_ref(), ProtocolPid(130), None, 5);
        let snapshot = Arc::new(MockSnapshotCache::new());
        snapshot.set(device.device_ref(), Pid::DimLevel, 99);

        let engine = DevicePid::builder(device, Pid::DimLevel)
            .transport(transport)
            .snapshot_cache(snapshot)
            .build();

        // No seed: zero-value until the background read lands.
        assert_eq!(engine.current_value(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.current_value(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_setter_transmits_only_final_value() {
        let (engine, transport, device) = engine(Pid::DimLevel);
        for value in [10, 20, 30, 40] {
            engine.set_value(value);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(transport.write_count(), 1);
        assert_eq!(
            transport.value(device.device_ref(), ProtocolPid(130), None),
            Some(40)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_resolves_inflight_readers() {
        let (engine, transport, device) = engine(Pid::DimLevel);
        transport.set_value(device.device_ref(), ProtocolPid(130), None, 1);
        transport.set_latency(Duration::from_millis(200));

        let reader = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.read_value(&CancellationToken::new(), false).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.dispose();
        assert_eq!(reader.await.unwrap(), Err(PidError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cancel_detaches_only_that_caller() {
        let (engine, transport, device) = engine(Pid::DimLevel);
        transport.set_value(device.device_ref(), ProtocolPid(130), None, 9);
        transport.set_latency(Duration::from_millis(100));

        let cancel_a = CancellationToken::new();
        let a = {
            let engine = engine.clone();
            let cancel_a = cancel_a.clone();
            tokio::spawn(async move { engine.read_value(&cancel_a, false).await })
        };
        let b = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.read_value(&CancellationToken::new(), false).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel_a.cancel();
        assert_eq!(a.await.unwrap(), Err(PidError::Canceled));
        // The shared read still completes for the other caller.
        assert_eq!(b.await.unwrap(), Ok(9));
        assert_eq!(transport.read_count(), 1);
    }
}
