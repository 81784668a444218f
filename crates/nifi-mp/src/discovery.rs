//! LAN session discovery.
//!
//! Hosts broadcast a [`DiscoveryBeacon`] once per interval. Browsers keep a
//! [`DiscoveryTable`] keyed by sender address; entries carry the local tick
//! at which they were last refreshed and are swept once they go quiet for the
//! freshness window.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nifi_proto::discovery::DiscoveryBeacon;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::events::{EventHub, LanEvent};

/// Millisecond tick counter that wraps at `u32::MAX`.
#[derive(Debug, Clone, Copy)]
pub struct MsClock {
    epoch: Instant,
}

impl Default for MsClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MsClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEntry {
    pub session_name: String,
    pub num_players: u8,
    pub max_players: u8,
    pub status: u8,
    /// Tick the host stamped on the beacon.
    pub sender_tick: u32,
    /// Local tick at which the entry was last refreshed.
    pub last_seen: u32,
}

#[derive(Debug, Clone)]
pub struct DiscoveryTable {
    entries: BTreeMap<Ipv4Addr, DiscoveryEntry>,
    stale_after: u32,
}

impl DiscoveryTable {
    pub fn new(stale_after_ms: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            stale_after: stale_after_ms,
        }
    }

    /// Store `beacon` unless we already hold a newer one from `from`.
    pub fn ingest(&mut self, from: Ipv4Addr, beacon: &DiscoveryBeacon, now: u32) -> bool {
        if let Some(existing) = self.entries.get(&from) {
            if beacon.tick <= existing.sender_tick {
                return false;
            }
        } else {
            debug!(%from, session = %beacon.session_name, "discovered LAN session");
        }

        self.entries.insert(
            from,
            DiscoveryEntry {
                session_name: beacon.session_name.clone(),
                num_players: beacon.num_players,
                max_players: beacon.max_players,
                status: beacon.status,
                sender_tick: beacon.tick,
                last_seen: now,
            },
        );
        true
    }

    /// Drop entries not refreshed within the freshness window. Returns how
    /// many were removed.
    pub fn sweep(&mut self, now: u32) -> usize {
        let before = self.entries.len();
        let stale_after = self.stale_after;
        self.entries.retain(|addr, entry| {
            let keep = now.wrapping_sub(entry.last_seen) < stale_after;
            if !keep {
                debug!(%addr, "LAN session expired");
            }
            keep
        });
        before - self.entries.len()
    }

    pub fn snapshot(&self) -> BTreeMap<Ipv4Addr, DiscoveryEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub(crate) async fn bind_broadcast_socket(bind: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((bind, port)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Receive beacons until the task is aborted.
pub(crate) async fn run_browser(
    socket: UdpSocket,
    table: Arc<Mutex<DiscoveryTable>>,
    clock: MsClock,
    version: u32,
    sweep_interval: Duration,
    hub: Arc<EventHub>,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    let mut buf = [0u8; 512];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = table.lock().sweep(clock.now());
                if removed > 0 {
                    hub.emit(LanEvent::DiscoveryListChanged);
                }
            }
            res = socket.recv_from(&mut buf) => {
                let (n, from) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        trace!(error = %e, "discovery recv failed");
                        continue;
                    }
                };
                let SocketAddr::V4(from) = from else {
                    continue;
                };
                let beacon = match DiscoveryBeacon::decode(&buf[..n])
                    .and_then(|b| b.validate(version).map(|()| b))
                {
                    Ok(b) => b,
                    Err(e) => {
                        trace!(%from, error = %e, "ignoring discovery datagram");
                        continue;
                    }
                };
                let changed = table.lock().ingest(*from.ip(), &beacon, clock.now());
                if changed {
                    hub.emit(LanEvent::DiscoveryListChanged);
                }
            }
        }
    }
}

/// Send the current advert to `target` once per interval until aborted.
pub(crate) async fn run_advertiser(
    socket: UdpSocket,
    target: SocketAddr,
    advert: Arc<Mutex<DiscoveryBeacon>>,
    clock: MsClock,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let packet = {
            let mut beacon = advert.lock().clone();
            beacon.tick = clock.now();
            beacon.encode()
        };
        if let Err(e) = socket.send_to(&packet, target).await {
            debug!(%target, error = %e, "discovery beacon send failed");
        }
    }
}
