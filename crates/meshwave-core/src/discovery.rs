//! UDP broadcast discovery: hub-side announce, peer-side scan with expiry.
//!
//! Grounded on `examples/original_source/src/discovery.c`. The original
//! hand-rolls the beacon with `snprintf` and parses it back with `strstr`;
//! this rewrite uses `serde`/`serde_json` (already in the teacher's
//! dependency stack) for both directions, while preserving the original's
//! tolerance for extra keys and its upsert/eviction semantics exactly.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Socket, Type};
use tracing::{info, warn};

use crate::error::DiscoveryError;

pub const DISC_PORT: u16 = 5556;
pub const DISC_INTERVAL_MS: u64 = 2000;
pub const DISC_EXPIRE_MS: i64 = 10_000;
pub const MAX_PEERS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct Beacon {
    name: String,
    ip: String,
    port: u16,
    #[serde(default = "default_version")]
    version: u32,
    #[serde(flatten)]
    _extra: serde_json::Map<String, serde_json::Value>,
}

fn default_version() -> u32 {
    1
}

/// Best-effort discovery of a non-loopback local IPv4 address. The original
/// walks `getifaddrs`; this rewrite uses the common "connect a UDP socket to
/// a routable address, read back the local endpoint" idiom, which needs no
/// extra interface-enumeration dependency and returns the same answer for
/// a single-homed LAN host. Falls back to `0.0.0.0` on any failure, matching
/// the original's documented fallback.
pub fn detect_local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|sock| {
            sock.connect("198.18.0.1:1")?;
            sock.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "0.0.0.0".to_string())
}

struct SeenEntry {
    info: ServerInfo,
    last_seen_ms: i64,
}

/// Hub-discovered servers, identified by `(ip, port)`. Guarded by a single
/// mutex per the shared-resource policy.
#[derive(Default)]
pub struct SeenServers {
    entries: Mutex<Vec<SeenEntry>>,
}

impl SeenServers {
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert(&self, info: ServerInfo) {
        let now = now_ms();
        let mut entries = self.entries.lock();
        if let Some(e) = entries
            .iter_mut()
            .find(|e| e.info.ip == info.ip && e.info.port == info.port)
        {
            e.info.name = info.name;
            e.last_seen_ms = now;
            return;
        }
        if entries.len() < MAX_PEERS {
            info!(name = %info.name, ip = %info.ip, port = info.port, "discovery: found server");
            entries.push(SeenEntry { info, last_seen_ms: now });
        }
    }

    fn evict_expired(&self) {
        let now = now_ms();
        let mut entries = self.entries.lock();
        let mut i = 0;
        while i < entries.len() {
            if now - entries[i].last_seen_ms > DISC_EXPIRE_MS {
                info!(name = %entries[i].info.name, "discovery: expired server");
                let last = entries.len() - 1;
                entries.swap(i, last);
                entries.pop();
            } else {
                i += 1;
            }
        }
    }

    pub fn get_all(&self) -> Vec<ServerInfo> {
        self.entries.lock().iter().map(|e| e.info.clone()).collect()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Background UDP broadcaster started on the hub side.
pub struct Announcer {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Announcer {
    pub fn start(server_name: String, data_port: u16, disc_port: u16) -> Result<Self, DiscoveryError> {
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();

        let sock = Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(DiscoveryError::Socket)?;
        sock.set_broadcast(true).map_err(DiscoveryError::Socket)?;
        #[cfg(not(target_os = "windows"))]
        let _ = sock.set_reuse_port(true);
        let udp: UdpSocket = sock.into();

        let local_ip = detect_local_ip();
        let beacon = Beacon {
            name: server_name.clone(),
            ip: local_ip.clone(),
            port: data_port,
            version: 1,
            _extra: Default::default(),
        };
        let payload = serde_json::to_vec(&beacon).expect("beacon always serializes");
        let dest: SocketAddr = format!("255.255.255.255:{disc_port}").parse().unwrap();

        info!(name = %server_name, ip = %local_ip, port = data_port, "discovery: announcing");

        let handle = thread::spawn(move || {
            while r.load(Ordering::Relaxed) {
                let _ = udp.send_to(&payload, dest);
                thread::sleep(Duration::from_millis(DISC_INTERVAL_MS));
            }
        });

        Ok(Self { running, handle: Some(handle) })
    }

    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

/// Background UDP listener started on the peer side; populates `SeenServers`.
pub struct Scanner {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    pub seen: Arc<SeenServers>,
}

impl Scanner {
    pub fn start(disc_port: u16) -> Result<Self, DiscoveryError> {
        let running = Arc::new(AtomicBool::new(true));
        let seen = Arc::new(SeenServers::new());
        let r = running.clone();
        let s = seen.clone();

        let sock = Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(DiscoveryError::Socket)?;
        sock.set_reuse_address(true).map_err(DiscoveryError::Socket)?;
        #[cfg(not(target_os = "windows"))]
        let _ = sock.set_reuse_port(true);
        let bind_addr: SocketAddr = format!("0.0.0.0:{disc_port}").parse().unwrap();
        sock.bind(&bind_addr.into()).map_err(DiscoveryError::Socket)?;
        sock.set_read_timeout(Some(Duration::from_secs(1)))
            .map_err(DiscoveryError::Socket)?;
        let udp: UdpSocket = sock.into();

        info!(port = disc_port, "discovery: scanning for servers");

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 1024];
            while r.load(Ordering::Relaxed) {
                match udp.recv_from(&mut buf) {
                    Ok((n, _src)) => {
                        if let Ok(beacon) = serde_json::from_slice::<Beacon>(&buf[..n]) {
                            if !beacon.name.is_empty() && !beacon.ip.is_empty() && beacon.port > 0 {
                                s.upsert(ServerInfo {
                                    name: beacon.name,
                                    ip: beacon.ip,
                                    port: beacon.port,
                                });
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        warn!(error = %e, "discovery: scan recv error");
                    }
                }
                s.evict_expired();
            }
        });

        Ok(Self { running, handle: Some(handle), seen })
    }

    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_refreshes_existing_entry_by_ip_port() {
        let seen = SeenServers::new();
        seen.upsert(ServerInfo { name: "a".into(), ip: "10.0.0.1".into(), port: 5557 });
        seen.upsert(ServerInfo { name: "a-renamed".into(), ip: "10.0.0.1".into(), port: 5557 });
        let all = seen.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "a-renamed");
    }

    #[test]
    fn upsert_caps_at_max_peers() {
        let seen = SeenServers::new();
        for i in 0..(MAX_PEERS + 5) {
            seen.upsert(ServerInfo {
                name: format!("s{i}"),
                ip: format!("10.0.0.{i}"),
                port: 5557,
            });
        }
        assert_eq!(seen.get_all().len(), MAX_PEERS);
    }

    #[test]
    fn beacon_json_round_trip_tolerates_extra_keys() {
        let raw = r#"{"name":"lab","ip":"192.168.1.10","port":5557,"version":1,"extra":"ignored"}"#;
        let beacon: Beacon = serde_json::from_str(raw).unwrap();
        assert_eq!(beacon.name, "lab");
        assert_eq!(beacon.port, 5557);
    }
}
