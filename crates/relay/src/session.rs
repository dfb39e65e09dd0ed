//! Rover Sessions and Live Stations: the Caster-owned half of the data
//! model. A [`LiveStation`] is a mountpoint's subscriber registry; a
//! [`RoverSessionHandle`] is one connected, authenticated rover.
//!
//! The registry is a `parking_lot::RwLock` over an `ahash` map, mutated
//! only by three events: new session on auth success, eviction on
//! broadcast failure, and the socket's own close. Broadcasts snapshot
//! the subscriber `Vec` before writing, so a concurrent removal never
//! blocks the write path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ahash::HashMap;
use parking_lot::RwLock;
use proto::nmea::FixQuality;
use proto::sourcetable::MountpointInfo;
use tokio::net::TcpStream;
use uuid::Uuid;

/// The rover's last reported position, parsed from an inbound GGA line.
#[derive(Debug, Clone, Copy)]
pub struct PositionReport {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub quality: FixQuality,
}

/// A snapshot of one Rover Session, suitable for the admin
/// `activeRoverSessions()` surface.
#[derive(Debug, Clone)]
pub struct RoverSessionSnapshot {
    pub session_id: Uuid,
    pub rover_id: String,
    pub username: String,
    pub mountpoint: String,
    pub peer_addr: SocketAddr,
    pub connected_at: SystemTime,
    pub last_position: Option<PositionReport>,
    pub last_position_update: Option<SystemTime>,
}

/// One connected, authenticated rover. Shared behind an `Arc` between
/// the connection's own read loop and the broadcast path; a
/// `tokio::net::TcpStream` supports concurrent `try_read`/`try_write`
/// from different tasks, so no lock is needed around the socket itself.
pub struct RoverSessionHandle {
    pub session_id: Uuid,
    pub rover_id: String,
    pub username: String,
    pub mountpoint: String,
    pub peer_addr: SocketAddr,
    pub connected_at: SystemTime,
    socket: Arc<TcpStream>,
    position: RwLock<Option<PositionReport>>,
    position_updated_at: RwLock<Option<SystemTime>>,
}

impl RoverSessionHandle {
    pub fn new(rover_id: String, username: String, mountpoint: String, peer_addr: SocketAddr, socket: Arc<TcpStream>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            rover_id,
            username,
            mountpoint,
            peer_addr,
            connected_at: SystemTime::now(),
            socket,
            position: RwLock::new(None),
            position_updated_at: RwLock::new(None),
        }
    }

    /// Non-blocking, best-effort write used by `broadcast`. `Ok(false)`
    /// means the socket was not writable right now or rejected a
    /// partial write — treated identically to a hard failure, since the
    /// core does not queue writes under backpressure.
    pub fn try_write_frame(&self, bytes: &[u8]) -> bool {
        match self.socket.try_write(bytes) {
            Ok(n) => n == bytes.len(),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(_) => false,
        }
    }

    pub fn record_position(&self, report: PositionReport) {
        *self.position.write() = Some(report);
        *self.position_updated_at.write() = Some(SystemTime::now());
    }

    pub fn snapshot(&self) -> RoverSessionSnapshot {
        RoverSessionSnapshot {
            session_id: self.session_id,
            rover_id: self.rover_id.clone(),
            username: self.username.clone(),
            mountpoint: self.mountpoint.clone(),
            peer_addr: self.peer_addr,
            connected_at: self.connected_at,
            last_position: *self.position.read(),
            last_position_update: *self.position_updated_at.read(),
        }
    }

    pub fn socket(&self) -> &Arc<TcpStream> {
        &self.socket
    }

    /// Tear down the underlying TCP connection. Used when a subscriber
    /// is evicted so its `rover_read_loop` task unblocks from
    /// `readable()` instead of waiting forever on a socket nobody
    /// reads or writes to anymore. `tokio::net::TcpStream` has no
    /// direct `shutdown(Shutdown::Both)`, so this goes through
    /// `socket2` the way the caster's keepalive setup does.
    pub fn close_socket(&self) {
        socket2::SockRef::from(&*self.socket).shutdown(std::net::Shutdown::Both).ok();
    }
}

/// A registered mountpoint and its live subscriber set. Metadata is
/// behind its own lock so `registerMountpoint` can replace it in place
/// without disturbing the subscriber set.
pub struct LiveStation {
    meta: RwLock<MountpointInfo>,
    subscribers: RwLock<HashMap<Uuid, Arc<RoverSessionHandle>>>,
}

impl LiveStation {
    pub fn new(meta: MountpointInfo) -> Self {
        Self { meta: RwLock::new(meta), subscribers: RwLock::new(HashMap::default()) }
    }

    pub fn meta(&self) -> MountpointInfo {
        self.meta.read().clone()
    }

    pub fn set_meta(&self, meta: MountpointInfo) {
        *self.meta.write() = meta;
    }

    pub fn insert(&self, session: Arc<RoverSessionHandle>) {
        self.subscribers.write().insert(session.session_id, session);
    }

    pub fn remove(&self, session_id: Uuid) -> Option<Arc<RoverSessionHandle>> {
        self.subscribers.write().remove(&session_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Write `bytes` to every subscriber, evicting those that refuse.
    /// Snapshots the subscriber list first so a subscriber added or
    /// removed mid-broadcast never observes a torn view.
    pub fn broadcast(&self, bytes: &[u8]) -> usize {
        let snapshot: Vec<Arc<RoverSessionHandle>> = self.subscribers.read().values().cloned().collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for session in snapshot {
            if session.try_write_frame(bytes) {
                delivered += 1;
            } else {
                dead.push(session.session_id);
            }
        }

        if !dead.is_empty() {
            let mut guard = self.subscribers.write();
            for id in dead {
                guard.remove(&id);
            }
        }

        delivered
    }

    pub fn snapshots(&self) -> Vec<RoverSessionSnapshot> {
        self.subscribers.read().values().map(|s| s.snapshot()).collect()
    }

    /// Evict every subscriber, closing each one's socket so its
    /// `rover_read_loop` task unblocks instead of leaking — used when a
    /// mountpoint is unregistered.
    pub fn evict_all(&self) -> Vec<Arc<RoverSessionHandle>> {
        let evicted: Vec<Arc<RoverSessionHandle>> = std::mem::take(&mut *self.subscribers.write()).into_values().collect();
        for session in &evicted {
            session.close_socket();
        }
        evicted
    }
}

/// The data liveness window: TCP up is not enough, data must have
/// flowed within this window.
pub const DATA_LIVENESS_WINDOW: Duration = Duration::from_secs(15);

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5000))
    }

    #[test]
    fn live_station_starts_with_no_subscribers() {
        let station = LiveStation::new(MountpointInfo::new("VRS01", "CORS", "VNM", 21.0, 105.0));
        assert_eq!(station.subscriber_count(), 0);
        assert_eq!(station.snapshots().len(), 0);
    }

    #[tokio::test]
    async fn broadcast_delivers_to_live_subscriber_and_evicts_closed_one() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();

        let connect = tokio::net::TcpStream::connect(local);
        let (client, (server, _)) = tokio::join!(connect, listener.accept());
        let client = client.unwrap();
        let server = server.unwrap();

        let station = LiveStation::new(MountpointInfo::new("VRS01", "CORS", "VNM", 21.0, 105.0));
        let handle = Arc::new(RoverSessionHandle::new(
            "rover-1".to_string(),
            "rover1".to_string(),
            "VRS01".to_string(),
            addr(),
            Arc::new(server),
        ));
        station.insert(handle.clone());
        assert_eq!(station.subscriber_count(), 1);

        let delivered = station.broadcast(&[0xD3, 0x00, 0x01]);
        assert_eq!(delivered, 1);
        assert_eq!(station.subscriber_count(), 1);

        drop(client);
        // Give the kernel a moment to tear down the peer before the next write.
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Repeated writes to a closed peer eventually fail and evict.
        for _ in 0..20 {
            station.broadcast(&[0xD3, 0x00, 0x01]);
            if station.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(station.subscriber_count(), 0);
    }
}
