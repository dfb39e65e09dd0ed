//! The Relay Supervisor: single source of truth for which relays are
//! running; bridges the Repository and the Caster Server, owns every
//! Source Session.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use ahash::HashMap;
use log::{info, warn};
use parking_lot::RwLock;
use proto::http::{classify_status_line, first_line, basic_auth_header, HeaderAccumulator, StatusOutcome};
use proto::sourcetable::{self, MountpointInfo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::caster::CasterServer;
use crate::error::CoreError;
use crate::repository::{Repository, StationStatus};
use crate::session::{RoverSessionSnapshot, DATA_LIVENESS_WINDOW};
use crate::source::{SourceClient, SourceObserver, UpstreamTarget};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Aggregate per-mountpoint view returned by `status()`.
#[derive(Debug, Clone)]
pub struct RelayStatus {
    pub mountpoint: String,
    pub source_connected: bool,
    pub data_flowing: bool,
    pub subscriber_count: usize,
}

/// Full `status()` surface.
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub caster_running: bool,
    pub total_relays: usize,
    pub total_rovers: usize,
    pub relays: Vec<RelayStatus>,
}

/// Result of `start()`, distinguishing the idempotent no-op case the
/// admin surface needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Per-station detail for the admin `stationStatus(id)` lookup.
#[derive(Debug, Clone)]
pub struct StationStatusView {
    pub station_name: String,
    pub source_connected: bool,
    pub source_host: String,
    pub source_mountpoint: String,
    pub clients_connected: usize,
}

struct Session {
    station_id: String,
    mountpoint: String,
    client: SourceClient,
    keepalive_stop: Arc<AtomicBool>,
}

/// Bridges a `SourceClient`'s observer hooks to the Caster's broadcast
/// path and the 60 s position keep-alive. Holds a `OnceLock`
/// back-reference to the client it is
/// wired to, filled in immediately after construction, since the client
/// and its observer are mutually referential.
struct Wiring {
    mountpoint: String,
    caster: CasterServer,
    station_lat: f64,
    station_lon: f64,
    keepalive_altitude_m: f64,
    keepalive_stop: Arc<AtomicBool>,
    client: Arc<OnceLock<SourceClient>>,
}

#[async_trait::async_trait]
impl SourceObserver for Wiring {
    async fn on_frame(&self, bytes: &[u8]) {
        self.caster.broadcast(&self.mountpoint, bytes);
    }

    async fn on_connected(&self) {
        self.keepalive_stop.store(false, Ordering::SeqCst);
        info!("source for {} connected", self.mountpoint);

        let Some(client) = self.client.get().cloned() else { return };
        client.send_position(self.station_lat, self.station_lon, self.keepalive_altitude_m).await;

        let stop = self.keepalive_stop.clone();
        let lat = self.station_lat;
        let lon = self.station_lon;
        let altitude = self.keepalive_altitude_m;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await;
            loop {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                ticker.tick().await;
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                client.send_position(lat, lon, altitude).await;
            }
        });
    }

    async fn on_disconnected(&self) {
        self.keepalive_stop.store(true, Ordering::SeqCst);
        info!("source for {} disconnected", self.mountpoint);
    }

    async fn on_error(&self, err: &CoreError) {
        warn!("source error on {}: {err}", self.mountpoint);
    }
}

/// Owner of all running Source Sessions, keyed by mountpoint name.
#[derive(Clone)]
pub struct RelaySupervisor {
    repository: Arc<dyn Repository>,
    caster: CasterServer,
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    keepalive_altitude_m: f64,
}

impl RelaySupervisor {
    pub fn new(repository: Arc<dyn Repository>, caster: CasterServer, keepalive_altitude_m: f64) -> Self {
        Self { repository, caster, sessions: Arc::new(RwLock::new(HashMap::default())), keepalive_altitude_m }
    }

    /// Start relaying a station's upstream feed into the caster, unless
    /// a live session for it is already running.
    pub async fn start(&self, station_id: &str) -> Result<StartOutcome, CoreError> {
        let station = self
            .repository
            .station_find_by_id(station_id)
            .await
            .map_err(|e| CoreError::RepositoryError(e.to_string()))?
            .ok_or_else(|| CoreError::NotFound(station_id.to_string()))?;
        station.validate()?;

        if let Some(existing) = self.sessions.read().get(&station.mountpoint).cloned() {
            if existing.client.stats().connected {
                return Ok(StartOutcome::AlreadyRunning);
            }
            self.stop_session(&existing).await;
        }

        self.caster.register_mountpoint(MountpointInfo::new(&station.mountpoint, &station.network, &station.country, station.lat, station.lon));

        let keepalive_stop = Arc::new(AtomicBool::new(true));
        let client_cell = Arc::new(OnceLock::new());
        let observer = Arc::new(Wiring {
            mountpoint: station.mountpoint.clone(),
            caster: self.caster.clone(),
            station_lat: station.lat,
            station_lon: station.lon,
            keepalive_altitude_m: self.keepalive_altitude_m,
            keepalive_stop: keepalive_stop.clone(),
            client: client_cell.clone(),
        });

        let target = UpstreamTarget {
            host: station.upstream_host.clone(),
            port: station.upstream_port,
            mountpoint: station.upstream_mountpoint.clone(),
            username: station.upstream_username.clone(),
            password: station.upstream_password.clone(),
        };

        let client = SourceClient::new(target, observer);
        client_cell.set(client.clone()).ok();
        client.connect();

        self.sessions.write().insert(
            station.mountpoint.clone(),
            Arc::new(Session { station_id: station.id.clone(), mountpoint: station.mountpoint.clone(), client, keepalive_stop }),
        );

        if let Err(e) = self.repository.station_update_status(&station.id, StationStatus::Active).await {
            warn!("failed to persist active status for station {}: {e}", station.id);
        }

        Ok(StartOutcome::Started)
    }

    /// Tear down a running session and unregister its mountpoint. Always succeeds.
    pub async fn stop(&self, mountpoint: &str, persist_status: bool) {
        let session = self.sessions.write().remove(mountpoint);
        if let Some(session) = &session {
            self.stop_session(session).await;
        }
        self.caster.unregister_mountpoint(mountpoint);

        if persist_status {
            if let Some(session) = session {
                if let Err(e) = self.repository.station_update_status(&session.station_id, StationStatus::Inactive).await {
                    warn!("failed to persist inactive status for station {}: {e}", session.station_id);
                }
            }
        }
    }

    async fn stop_session(&self, session: &Session) {
        session.keepalive_stop.store(true, Ordering::SeqCst);
        session.client.disconnect().await;
    }

    /// Reconcile running sessions against the repository's active
    /// stations: start any that are missing, stop any that are stale.
    pub async fn sync_with_repository(&self) -> Result<(), CoreError> {
        self.caster.refresh_from_repository().await?;

        let active = self.repository.station_find_active().await.map_err(|e| CoreError::RepositoryError(e.to_string()))?;
        let active_mountpoints: HashSet<String> = active.iter().map(|s| s.mountpoint.clone()).collect();

        for station in &active {
            if !self.sessions.read().contains_key(&station.mountpoint) {
                if let Err(e) = self.start(&station.id).await {
                    warn!("failed to start relay for station {}: {e}", station.id);
                }
            }
        }

        let stale: Vec<String> = self
            .sessions
            .read()
            .keys()
            .filter(|mp| !active_mountpoints.contains(*mp))
            .cloned()
            .collect();
        for mountpoint in stale {
            self.stop(&mountpoint, false).await;
        }

        Ok(())
    }

    /// Aggregate status across every running relay session.
    pub fn status(&self) -> SupervisorStatus {
        let sessions = self.sessions.read();
        let relays: Vec<RelayStatus> = sessions
            .values()
            .map(|s| RelayStatus {
                mountpoint: s.mountpoint.clone(),
                source_connected: s.client.stats().connected,
                data_flowing: s.client.is_data_live(DATA_LIVENESS_WINDOW),
                subscriber_count: self.caster.subscriber_count(&s.mountpoint),
            })
            .collect();

        SupervisorStatus {
            caster_running: true,
            total_relays: relays.len(),
            total_rovers: self.caster.active_rovers().len(),
            relays,
        }
    }

    /// The "online" predicate: connected AND data flowing within the
    /// liveness window.
    pub fn station_online(&self, mountpoint: &str) -> bool {
        self.sessions
            .read()
            .get(mountpoint)
            .map(|s| s.client.stats().connected && s.client.is_data_live(DATA_LIVENESS_WINDOW))
            .unwrap_or(false)
    }

    pub fn active_rover_sessions(&self) -> Vec<RoverSessionSnapshot> {
        self.caster.active_rovers()
    }

    /// Detail view for one station by id, or `None` if no such station
    /// is known to the repository.
    pub async fn station_status(&self, station_id: &str) -> Result<Option<StationStatusView>, CoreError> {
        let Some(station) = self.repository.station_find_by_id(station_id).await.map_err(|e| CoreError::RepositoryError(e.to_string()))? else {
            return Ok(None);
        };

        let session = self.sessions.read().get(&station.mountpoint).cloned();
        Ok(Some(StationStatusView {
            station_name: station.mountpoint.clone(),
            source_connected: session.map(|s| s.client.stats().connected && s.client.is_data_live(DATA_LIVENESS_WINDOW)).unwrap_or(false),
            source_host: station.upstream_host,
            source_mountpoint: station.upstream_mountpoint,
            clients_connected: self.caster.subscriber_count(&station.mountpoint),
        }))
    }

    /// Fetch and parse a remote caster's sourcetable with a hard 10 s
    /// deadline.
    pub async fn probe_source(&self, host: &str, port: u16, user: Option<&str>, pass: Option<&str>) -> Result<Vec<MountpointInfo>, CoreError> {
        timeout(PROBE_TIMEOUT, probe_source_inner(host, port, user, pass)).await.map_err(|_| CoreError::Timeout)?
    }

    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            self.stop_session(session).await;
        }
    }
}

async fn probe_source_inner(host: &str, port: u16, user: Option<&str>, pass: Option<&str>) -> Result<Vec<MountpointInfo>, CoreError> {
    let mut stream = TcpStream::connect((host, port)).await?;

    let mut request = format!("GET / HTTP/1.1\r\nHost: {host}:{port}\r\nUser-Agent: NTRIP-Relay/1.0\r\n");
    if let (Some(user), Some(pass)) = (user, pass) {
        request.push_str(&basic_auth_header(user, pass));
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut accumulator = HeaderAccumulator::new();
    let mut buf = [0u8; 8192];
    let (head_len, mut body) = loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(CoreError::TransportError(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "caster closed during probe")));
        }
        match accumulator.feed(&buf[..n]).map_err(|e| CoreError::ProtocolError(e.to_string()))? {
            Some(end) => {
                let full = accumulator.buf().to_vec();
                break (end, full[end..].to_vec());
            }
            None => continue,
        }
    };

    let head = accumulator.buf()[..head_len].to_vec();
    let status_line = first_line(&head).ok_or_else(|| CoreError::ProtocolError("empty status line".to_string()))?;
    match classify_status_line(status_line) {
        StatusOutcome::IcyOk => {}
        StatusOutcome::Unauthorized => return Err(CoreError::AuthRejected),
        StatusOutcome::Other if status_line.starts_with("SOURCETABLE") => {}
        StatusOutcome::Other => return Err(CoreError::ProtocolError(status_line.to_string())),
    }

    // Drain whatever remains of the response, up to the `Content-Length`
    // if present, else until the peer closes.
    let content_length = std::str::from_utf8(&head)
        .ok()
        .and_then(|text| text.lines().find_map(|l| l.strip_prefix("Content-Length:").or_else(|| l.strip_prefix("content-length:"))))
        .and_then(|v| v.trim().parse::<usize>().ok());

    if let Some(total) = content_length {
        while body.len() < total {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        }
    } else {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
    }

    sourcetable::parse_sourcetable(&body).map_err(|e| CoreError::ProtocolError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caster::CasterConfig;
    use crate::repository::{InMemoryRepository, Station, StationStatus};
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

    fn station(id: &str, mountpoint: &str, status: StationStatus) -> Station {
        Station {
            id: id.to_string(),
            mountpoint: mountpoint.to_string(),
            description: "".to_string(),
            lat: 21.0285,
            lon: 105.8542,
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 1,
            upstream_mountpoint: "RTCM3".to_string(),
            upstream_username: None,
            upstream_password: None,
            status,
            carrier: "2".to_string(),
            nav_system: "GPS".to_string(),
            network: "CORS".to_string(),
            country: "VNM".to_string(),
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_once_connected() {
        let repo = StdArc::new(InMemoryRepository::new());
        repo.insert_station(station("s1", "VRS01", StationStatus::Inactive));
        let caster = CasterServer::new(config(), repo.clone());
        let supervisor = RelaySupervisor::new(repo, caster, 100.0);

        let outcome = supervisor.start("s1").await.unwrap();
        assert_eq!(outcome, StartOutcome::Started);
        // Not yet connected (upstream port 1 will never accept), so a
        // second start is not a no-op yet, but must not error and must
        // leave exactly one session registered either way.
        let _ = supervisor.start("s1").await;
        assert_eq!(supervisor.status().total_relays, 1);
    }

    #[tokio::test]
    async fn stop_on_unknown_mountpoint_is_success() {
        let repo = StdArc::new(InMemoryRepository::new());
        let caster = CasterServer::new(config(), repo.clone());
        let supervisor = RelaySupervisor::new(repo, caster, 100.0);
        supervisor.stop("does-not-exist", true).await;
    }

    #[tokio::test]
    async fn sync_starts_active_and_stops_stale_stations() {
        let repo = StdArc::new(InMemoryRepository::new());
        repo.insert_station(station("a", "A", StationStatus::Active));
        repo.insert_station(station("b", "B", StationStatus::Active));
        let caster = CasterServer::new(config(), repo.clone());
        let supervisor = RelaySupervisor::new(repo.clone(), caster, 100.0);

        supervisor.sync_with_repository().await.unwrap();
        assert_eq!(supervisor.status().total_relays, 2);

        repo.insert_station(station("b", "B", StationStatus::Inactive));
        supervisor.sync_with_repository().await.unwrap();
        assert_eq!(supervisor.status().total_relays, 1);
    }
}
