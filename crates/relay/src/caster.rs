//! The Caster Server: a single TCP listener that serves
//! the sourcetable at `/` and per-mountpoint RTCM streams to
//! authenticated rovers, owning the Live Station registry and every
//! Rover Session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::HashMap;
use log::{info, warn};
use parking_lot::RwLock;
use proto::http::{first_line, parse_basic_auth, parse_request, HeaderAccumulator};
use proto::nmea::Gga;
use proto::sourcetable::{self, CasterInfo, MountpointInfo};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

use crate::error::CoreError;
use crate::repository::{Date, Repository};
use crate::session::{LiveStation, PositionReport, RoverSessionHandle, RoverSessionSnapshot};

const ROVER_KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Bound configuration for the caster listener and sourcetable identity
/// fields.
#[derive(Debug, Clone)]
pub struct CasterConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub operator: String,
    pub country: String,
    pub centroid_lat: f64,
    pub centroid_lon: f64,
    pub network: String,
}

impl CasterConfig {
    fn caster_info(&self) -> CasterInfo {
        CasterInfo {
            host: self.bind_host.clone(),
            port: self.bind_port,
            identifier: "NTRIP-Relay".to_string(),
            operator: self.operator.clone(),
            country: self.country.clone(),
            centroid_lat: self.centroid_lat,
            centroid_lon: self.centroid_lon,
            network: self.network.clone(),
        }
    }
}

/// Owns the mountpoint registry and the accept loop. Cheap to clone: an
/// `Arc` wrapper, so the Supervisor and the accept task share one
/// instance.
#[derive(Clone)]
pub struct CasterServer {
    inner: Arc<Inner>,
}

struct Inner {
    config: CasterConfig,
    repository: Arc<dyn Repository>,
    stations: RwLock<HashMap<String, Arc<LiveStation>>>,
}

impl CasterServer {
    pub fn new(config: CasterConfig, repository: Arc<dyn Repository>) -> Self {
        Self { inner: Arc::new(Inner { config, repository, stations: RwLock::new(HashMap::default()) }) }
    }

    /// Bind the listener and run the accept loop until the returned
    /// future is dropped or `shutdown` unregisters every mountpoint.
    /// Idempotent in spirit: binding twice is a caller error we don't
    /// guard against (only one `start()` call is ever made by the
    /// Supervisor).
    pub async fn start(&self) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.inner.config.bind_host, self.inner.config.bind_port);
        let listener = TcpListener::bind(&addr).await?;
        info!("caster listening on {addr}");

        loop {
            let (socket, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(socket, peer).await {
                    warn!("connection from {peer} ended: {e}");
                }
            });
        }
    }

    /// Insert or replace a mountpoint's metadata without ever disturbing
    /// existing subscribers; since `LiveStation`
    /// holds its own subscriber set, swapping it out when there's
    /// already one registered would drop them, so an existing entry's
    /// metadata is updated via its `meta` field instead of replacing the
    /// `Arc`. A fresh entry starts with an empty subscriber set.
    pub fn register_mountpoint(&self, meta: MountpointInfo) {
        let guard = self.inner.stations.read();
        if let Some(existing) = guard.get(&meta.name) {
            existing.set_meta(meta);
            return;
        }
        drop(guard);
        self.inner.stations.write().entry(meta.name.clone()).or_insert_with(|| Arc::new(LiveStation::new(meta)));
    }

    pub fn unregister_mountpoint(&self, name: &str) {
        if let Some(station) = self.inner.stations.write().remove(name) {
            station.evict_all();
        }
    }

    pub fn broadcast(&self, name: &str, bytes: &[u8]) -> usize {
        match self.inner.stations.read().get(name) {
            Some(station) => station.broadcast(bytes),
            None => 0,
        }
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.inner.stations.read().get(name).map(|s| s.subscriber_count()).unwrap_or(0)
    }

    pub fn active_rovers(&self) -> Vec<RoverSessionSnapshot> {
        self.inner.stations.read().values().flat_map(|s| s.snapshots()).collect()
    }

    pub fn mountpoint_names(&self) -> Vec<String> {
        self.inner.stations.read().keys().cloned().collect()
    }

    pub fn sourcetable(&self) -> Vec<u8> {
        let mountpoints: Vec<MountpointInfo> = self.inner.stations.read().values().map(|s| s.meta()).collect();
        sourcetable::render_response(&mountpoints, &self.inner.config.caster_info())
    }

    /// Bring the Live Station set in line with the Repository's
    /// `status=active` stations: add missing, remove stale. Does not
    /// start or stop Source Clients — that is the Supervisor's job;
    /// this only keeps the registry (and hence the sourcetable) honest.
    pub async fn refresh_from_repository(&self) -> Result<(), CoreError> {
        let active = self.inner.repository.station_find_active().await.map_err(|e| CoreError::RepositoryError(e.to_string()))?;
        let active_names: std::collections::HashSet<String> = active.iter().map(|s| s.mountpoint.clone()).collect();

        for station in &active {
            if !self.inner.stations.read().contains_key(&station.mountpoint) {
                self.register_mountpoint(MountpointInfo::new(&station.mountpoint, &station.network, &station.country, station.lat, station.lon));
            }
        }

        let stale: Vec<String> = self
            .inner
            .stations
            .read()
            .keys()
            .filter(|name| !active_names.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            self.unregister_mountpoint(&name);
        }

        Ok(())
    }

    /// Run one accepted connection through request parsing, auth, and
    /// (on success) the rover read loop. `pub` so integration tests can
    /// drive a caster over a pre-bound loopback listener without going
    /// through the long-running `start()` accept loop.
    pub async fn handle_connection(&self, socket: TcpStream, peer: SocketAddr) -> Result<(), CoreError> {
        socket.set_nodelay(true).ok();

        let mut accumulator = HeaderAccumulator::new();
        let mut buf = [0u8; 4096];
        let (head_len, residual) = loop {
            socket.readable().await?;
            let n = match socket.try_read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            };
            match accumulator.feed(&buf[..n]) {
                Ok(Some(end)) => {
                    let full = accumulator.buf().to_vec();
                    break (end, full[end..].to_vec());
                }
                Ok(None) => continue,
                Err(_) => {
                    write_response(&socket, b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
                    return Ok(());
                }
            }
        };

        let head = &accumulator.buf()[..head_len];
        let request = match parse_request(head) {
            Ok(r) => r,
            Err(_) => {
                write_response(&socket, b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
                return Ok(());
            }
        };

        if request.method != "GET" {
            write_response(&socket, b"HTTP/1.1 405 Method Not Allowed\r\n\r\n").await;
            return Ok(());
        }

        if request.target == "/" {
            let body = self.sourcetable();
            write_response(&socket, &body).await;
            return Ok(());
        }

        let name = request.target.trim_start_matches('/').to_string();
        if !self.inner.stations.read().contains_key(&name) {
            write_response(&socket, b"HTTP/1.1 404 Not Found\r\n\r\nERROR - Mountpoint not found").await;
            return Ok(());
        }

        let creds = request.headers.get("authorization").and_then(parse_basic_auth);
        let (username, password) = match creds {
            Some(c) => c,
            None => {
                write_unauthorized(&socket).await;
                return Ok(());
            }
        };

        let rover = match self.inner.repository.rover_find_by_username(&username).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                write_unauthorized(&socket).await;
                return Ok(());
            }
            Err(e) => return Err(CoreError::RepositoryError(e.to_string())),
        };

        if !rover.password.verify(&password) || !rover.is_currently_active(Date::today()) {
            write_unauthorized(&socket).await;
            return Ok(());
        }

        if let Err(e) = self.inner.repository.rover_touch_last_connection(&rover.id, std::time::SystemTime::now()).await {
            warn!("failed to touch last_connection for rover {}: {e}", rover.id);
        }

        socket.set_nodelay(true).ok();
        SockRef::from(&socket).set_tcp_keepalive(&TcpKeepalive::new().with_time(ROVER_KEEPALIVE_IDLE)).ok();
        write_all_blocking(&socket, b"ICY 200 OK\r\n\r\n").await?;

        let socket = Arc::new(socket);
        let handle = Arc::new(RoverSessionHandle::new(rover.id.clone(), rover.username.clone(), name.clone(), peer, socket.clone()));

        {
            let guard = self.inner.stations.read();
            match guard.get(&name) {
                Some(station) => station.insert(handle.clone()),
                None => return Ok(()),
            }
        }
        info!("rover {} ({peer}) streaming on {name}", rover.username);

        if !residual.is_empty() {
            ingest_nmea(&handle, &residual);
        }

        self.rover_read_loop(socket, handle.clone(), name).await;
        Ok(())
    }

    async fn rover_read_loop(&self, socket: Arc<TcpStream>, handle: Arc<RoverSessionHandle>, mountpoint: String) {
        let mut buf = [0u8; 1024];
        let mut pending = Vec::new();
        loop {
            if socket.readable().await.is_err() {
                break;
            }
            match socket.try_read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    if let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                        let line = pending[..=pos].to_vec();
                        pending.drain(..=pos);
                        ingest_nmea(&handle, &line);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(_) => break,
            }
        }

        if let Some(station) = self.inner.stations.read().get(&mountpoint) {
            station.remove(handle.session_id);
        }
    }
}

fn ingest_nmea(handle: &RoverSessionHandle, line: &[u8]) {
    let Ok(text) = std::str::from_utf8(line) else { return };
    for segment in text.split("\r\n").flat_map(|l| l.split('\n')) {
        if let Some(gga) = Gga::parse(segment) {
            handle.record_position(PositionReport { lat: gga.lat, lon: gga.lon, alt: gga.altitude_m, quality: gga.quality });
        }
    }
}

async fn write_unauthorized(socket: &TcpStream) {
    write_all_blocking(socket, b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"NTRIP Caster\"\r\n\r\n")
        .await
        .ok();
}

async fn write_response(socket: &TcpStream, bytes: &[u8]) {
    write_all_blocking(socket, bytes).await.ok();
}

async fn write_all_blocking(socket: &TcpStream, mut bytes: &[u8]) -> std::io::Result<()> {
    while !bytes.is_empty() {
        socket.writable().await?;
        match socket.try_write(bytes) {
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryRepository, PasswordVerifier, Rover, RoverStatus};
    use std::sync::Arc as StdArc;

    fn config() -> CasterConfig {
        CasterConfig {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 0,
            operator: "NTRIP Relay Service".to_string(),
            country: "VNM".to_string(),
            centroid_lat: 21.0,
            centroid_lon: 105.0,
            network: "CORS".to_string(),
        }
    }

    #[test]
    fn sourcetable_reflects_registered_mountpoints() {
        let repo = StdArc::new(InMemoryRepository::new());
        let caster = CasterServer::new(config(), repo);
        assert!(!caster.sourcetable().is_empty());
        caster.register_mountpoint(MountpointInfo::new("VRS01", "CORS", "VNM", 21.0285, 105.8542));
        let body = String::from_utf8(caster.sourcetable()).unwrap();
        assert!(body.contains("STR;VRS01;"));
    }

    #[test]
    fn unregister_drops_mountpoint_from_sourcetable() {
        let repo = StdArc::new(InMemoryRepository::new());
        let caster = CasterServer::new(config(), repo);
        caster.register_mountpoint(MountpointInfo::new("VRS01", "CORS", "VNM", 21.0285, 105.8542));
        caster.unregister_mountpoint("VRS01");
        let body = String::from_utf8(caster.sourcetable()).unwrap();
        assert!(!body.contains("STR;"));
    }

    #[tokio::test]
    async fn refresh_from_repository_adds_and_removes_stale_mountpoints() {
        use crate::repository::{Station, StationStatus};

        let repo = StdArc::new(InMemoryRepository::new());
        repo.insert_station(Station {
            id: "s1".into(),
            mountpoint: "VRS01".into(),
            description: "".into(),
            lat: 21.0285,
            lon: 105.8542,
            upstream_host: "upstream".into(),
            upstream_port: 2101,
            upstream_mountpoint: "RTCM3".into(),
            upstream_username: None,
            upstream_password: None,
            status: StationStatus::Active,
            carrier: "2".into(),
            nav_system: "GPS".into(),
            network: "CORS".into(),
            country: "VNM".into(),
        });

        let caster = CasterServer::new(config(), repo.clone());
        caster.refresh_from_repository().await.unwrap();
        assert_eq!(caster.mountpoint_names(), vec!["VRS01".to_string()]);

        repo.insert_station(Station {
            id: "s1".into(),
            mountpoint: "VRS01".into(),
            description: "".into(),
            lat: 21.0285,
            lon: 105.8542,
            upstream_host: "upstream".into(),
            upstream_port: 2101,
            upstream_mountpoint: "RTCM3".into(),
            upstream_username: None,
            upstream_password: None,
            status: StationStatus::Inactive,
            carrier: "2".into(),
            nav_system: "GPS".into(),
            network: "CORS".into(),
            country: "VNM".into(),
        });
        caster.refresh_from_repository().await.unwrap();
        assert!(caster.mountpoint_names().is_empty());
    }

    #[tokio::test]
    async fn end_to_end_happy_path_streams_one_frame() {
        let repo = StdArc::new(InMemoryRepository::new());
        repo.insert_rover(Rover {
            id: "r1".into(),
            username: "rover1".into(),
            password: PasswordVerifier::new("rover123"),
            user_id: "u1".into(),
            station_id: None,
            status: RoverStatus::Active,
            start_date: None,
            end_date: None,
            last_connection: None,
        });

        let caster = CasterServer::new(config(), repo);
        caster.register_mountpoint(MountpointInfo::new("VRS01", "CORS", "VNM", 21.0285, 105.8542));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = caster.clone();
        tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.unwrap();
            server.handle_connection(socket, peer).await.ok();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let auth = proto::http::basic_auth_header("rover1", "rover123");
        let req = format!("GET /VRS01 HTTP/1.1\r\nHost: x\r\nAuthorization: {auth}\r\n\r\n");
        client.write_all(req.as_bytes()).await.unwrap();

        let mut resp = [0u8; 32];
        let n = client.read(&mut resp).await.unwrap();
        assert_eq!(&resp[..n], b"ICY 200 OK\r\n\r\n");

        // Give the server a moment to register the subscriber before broadcast.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let delivered = caster.broadcast("VRS01", &[0xD3, 0x00, 0x13]);
        assert_eq!(delivered, 1);

        let mut frame = [0u8; 3];
        client.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [0xD3, 0x00, 0x13]);

        let rovers = caster.active_rovers();
        assert_eq!(rovers.len(), 1);
        assert_eq!(rovers[0].mountpoint, "VRS01");
    }
}
