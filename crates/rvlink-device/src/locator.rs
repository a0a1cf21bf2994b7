//! Gateway discovery
//!
//! CAN-to-Ethernet bridges announce themselves with a small JSON beacon
//! broadcast to a well-known UDP port. The locator listens for beacons,
//! keeps a table of live bridges, and expires entries that stop announcing.
//! Two tasks: a receive loop (bounded poll so shutdown is observed even on
//! a silent network) and an expiry sweep.
//!
//! The beacon's `Port` field arrives as a string; an unparsable value is
//! recorded as port 0 rather than dropping the bridge, matching gateway
//! firmware that has shipped with malformed beacons.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LocatorConfig;

const BEACON_MANUFACTURER: &str = "IDS";
const BEACON_PRODUCT: &str = "CAN_TO_ETHERNET_GATEWAY";

/// Raw beacon payload as broadcast by the bridge.
#[derive(Debug, Deserialize)]
struct Beacon {
    #[serde(rename = "Mfg", default)]
    manufacturer: String,
    #[serde(rename = "Product", default)]
    product: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Port", default)]
    port: String,
}

/// One live bridge.
#[derive(Debug, Clone)]
pub struct GatewayRecord {
    pub name: String,
    pub address: IpAddr,
    /// TCP port the bridge serves connections on; 0 when the beacon's
    /// port field could not be parsed
    pub port: u16,
    /// Wall-clock time of the first beacon; survives re-announcements
    pub discovered_at: DateTime<Utc>,
    last_seen: Instant,
}

impl GatewayRecord {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_seen.elapsed() > ttl
    }
}

/// Change notifications for the bridge table.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Added(GatewayRecord),
    /// An already-known bridge announced a different name or port
    Updated(GatewayRecord),
    /// No beacon within the record TTL
    Removed(GatewayRecord),
}

/// Beacons are keyed by source address so a bridge that reboots onto a
/// different serving port updates its record instead of duplicating it.
type GatewayKey = IpAddr;

struct LocatorShared {
    records: Mutex<HashMap<GatewayKey, GatewayRecord>>,
    events: broadcast::Sender<GatewayEvent>,
    config: LocatorConfig,
}

pub struct GatewayLocator {
    shared: Arc<LocatorShared>,
    shutdown: CancellationToken,
    local_port: u16,
}

impl GatewayLocator {
    /// Bind the beacon socket and start the receive and sweep tasks.
    pub async fn start(config: LocatorConfig) -> std::io::Result<Self> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.listen_port);
        let socket = UdpSocket::bind(bind).await?;
        let local_port = socket.local_addr()?.port();
        info!(port = local_port, "gateway locator listening");

        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(LocatorShared {
            records: Mutex::new(HashMap::new()),
            events,
            config,
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(receive_loop(
            socket,
            shared.clone(),
            shutdown.child_token(),
        ));
        tokio::spawn(sweep_loop(shared.clone(), shutdown.child_token()));

        Ok(Self {
            shared,
            shutdown,
            local_port,
        })
    }

    /// Actual bound port (differs from the configured one when binding
    /// ephemeral).
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Snapshot of the live bridge table.
    pub fn snapshot(&self) -> Vec<GatewayRecord> {
        self.shared.records.lock().values().cloned().collect()
    }

    /// Look up one bridge by source address.
    pub fn find(&self, address: IpAddr) -> Option<GatewayRecord> {
        self.shared.records.lock().get(&address).cloned()
    }

    /// Forget every known bridge, emitting a `Removed` event for each.
    /// Discovery keeps running; live bridges re-announce within a beacon
    /// period.
    pub fn clear(&self) {
        let dropped: Vec<GatewayRecord> = self.shared.records.lock().drain().map(|(_, r)| r).collect();
        for record in dropped {
            let _ = self.shared.events.send(GatewayEvent::Removed(record));
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.shared.events.subscribe()
    }

    /// Stop both tasks. Records are kept so a restart can diff against them.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for GatewayLocator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Parse and filter one datagram. `Err` means a malformed packet (worth a
/// receive backoff); `Ok(None)` means a well-formed beacon from something
/// other than a bridge.
fn decode_beacon(data: &[u8]) -> Result<Option<(String, u16)>, serde_json::Error> {
    let beacon: Beacon = serde_json::from_slice(data)?;
    if beacon.manufacturer != BEACON_MANUFACTURER && beacon.product != BEACON_PRODUCT {
        return Ok(None);
    }
    let port = beacon.port.parse().unwrap_or_else(|_| {
        warn!(port = %beacon.port, "beacon port not parsable, recording 0");
        0
    });
    Ok(Some((beacon.name, port)))
}

async fn receive_loop(socket: UdpSocket, shared: Arc<LocatorShared>, shutdown: CancellationToken) {
    let poll = Duration::from_millis(shared.config.receive_poll_ms);
    let backoff = Duration::from_millis(shared.config.receive_backoff_ms);
    let mut buf = [0u8; 1500];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => return,
            r = tokio::time::timeout(poll, socket.recv_from(&mut buf)) => r,
        };
        let (len, from) = match received {
            // Poll window elapsed with nothing on the wire.
            Err(_) => continue,
            Ok(Err(e)) => {
                warn!(error = %e, "beacon receive failed");
                tokio::time::sleep(backoff).await;
                continue;
            }
            Ok(Ok(pair)) => pair,
        };
        match decode_beacon(&buf[..len]) {
            Err(e) => {
                warn!(from = %from, error = %e, "malformed beacon");
                tokio::time::sleep(backoff).await;
            }
            Ok(None) => {
                debug!(from = %from, "ignoring non-bridge beacon");
            }
            Ok(Some((name, port))) => {
                record_beacon(&shared, from.ip(), name, port);
            }
        }
    }
}

fn record_beacon(shared: &LocatorShared, address: IpAddr, name: String, port: u16) {
    let mut record = GatewayRecord {
        name,
        address,
        port,
        discovered_at: Utc::now(),
        last_seen: Instant::now(),
    };
    let event = {
        let mut records = shared.records.lock();
        if let Some(prev) = records.get(&address) {
            record.discovered_at = prev.discovered_at;
        }
        match records.insert(address, record.clone()) {
            None => {
                info!(%address, port, name = %record.name, "bridge discovered");
                Some(GatewayEvent::Added(record))
            }
            Some(prev) if prev.name != record.name || prev.port != record.port => {
                info!(%address, port, name = %record.name, "bridge re-announced with new identity");
                Some(GatewayEvent::Updated(record))
            }
            // Plain keep-alive beacon; last_seen already refreshed.
            Some(_) => None,
        }
    };
    if let Some(event) = event {
        let _ = shared.events.send(event);
    }
}

async fn sweep_loop(shared: Arc<LocatorShared>, shutdown: CancellationToken) {
    let interval = Duration::from_millis(shared.config.sweep_interval_ms);
    let ttl = Duration::from_millis(shared.config.record_ttl_ms);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let expired: Vec<GatewayRecord> = {
            let mut records = shared.records.lock();
            let gone: Vec<GatewayKey> = records
                .iter()
                .filter(|(_, r)| r.is_expired(ttl))
                .map(|(k, _)| *k)
                .collect();
            gone.into_iter()
                .filter_map(|k| records.remove(&k))
                .collect()
        };
        for record in expired {
            info!(address = %record.address, name = %record.name, "bridge expired");
            let _ = shared.events.send(GatewayEvent::Removed(record));
        }
    }
}
