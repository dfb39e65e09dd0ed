//! The admin-facing core surface: a thin facade over
//! [`relay::RelaySupervisor`] returning plain DTOs, so whatever HTTP/JSON
//! layer calls into this process has something concrete to serialise.

use std::sync::Arc;
use std::time::SystemTime;

use relay::{CoreError, RelaySupervisor, RoverSessionSnapshot, StartOutcome, StationStatusView};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StartRelayResult {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopRelayResult {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatusDto {
    pub id: String,
    pub name: String,
    pub source_connected: bool,
    pub clients_connected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusDto {
    pub caster_running: bool,
    pub total_relays: usize,
    pub total_rovers: usize,
    pub relays: Vec<RelayStatusDto>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StationStatusDto {
    pub station_name: String,
    pub source_connected: bool,
    pub source_host: String,
    pub source_mountpoint: String,
    pub clients_connected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoverSessionDto {
    pub session_id: String,
    pub rover_id: String,
    pub username: String,
    pub mountpoint: String,
    pub ip: String,
    pub connected_at: SystemTime,
    pub gnss_status: Option<String>,
    pub last_position: Option<[f64; 3]>,
    pub last_position_update: Option<SystemTime>,
}

impl From<StationStatusView> for StationStatusDto {
    fn from(v: StationStatusView) -> Self {
        Self {
            station_name: v.station_name,
            source_connected: v.source_connected,
            source_host: v.source_host,
            source_mountpoint: v.source_mountpoint,
            clients_connected: v.clients_connected,
        }
    }
}

impl From<RoverSessionSnapshot> for RoverSessionDto {
    fn from(s: RoverSessionSnapshot) -> Self {
        Self {
            session_id: s.session_id.to_string(),
            rover_id: s.rover_id,
            username: s.username,
            mountpoint: s.mountpoint,
            ip: s.peer_addr.to_string(),
            connected_at: s.connected_at,
            gnss_status: s.last_position.map(|p| p.quality.label().to_string()),
            last_position: s.last_position.map(|p| [p.lat, p.lon, p.alt]),
            last_position_update: s.last_position_update,
        }
    }
}

/// The facade itself: a cheap wrapper around one `Arc<RelaySupervisor>`.
#[derive(Clone)]
pub struct AdminApi {
    supervisor: Arc<RelaySupervisor>,
}

impl AdminApi {
    pub fn new(supervisor: Arc<RelaySupervisor>) -> Self {
        Self { supervisor }
    }

    pub async fn start_relay(&self, station_id: &str) -> StartRelayResult {
        match self.supervisor.start(station_id).await {
            Ok(StartOutcome::Started) => StartRelayResult { ok: true, message: "started".to_string() },
            Ok(StartOutcome::AlreadyRunning) => StartRelayResult { ok: true, message: "already running".to_string() },
            Err(e) => StartRelayResult { ok: false, message: e.to_string() },
        }
    }

    pub async fn stop_relay(&self, mountpoint: &str, persist_status: bool) -> StopRelayResult {
        self.supervisor.stop(mountpoint, persist_status).await;
        StopRelayResult { ok: true, message: "stopped".to_string() }
    }

    pub async fn sync_with_repository(&self) -> Result<(), CoreError> {
        self.supervisor.sync_with_repository().await
    }

    pub fn status(&self) -> StatusDto {
        let status = self.supervisor.status();
        StatusDto {
            caster_running: status.caster_running,
            total_relays: status.total_relays,
            total_rovers: status.total_rovers,
            relays: status
                .relays
                .into_iter()
                .map(|r| RelayStatusDto {
                    id: r.mountpoint.clone(),
                    name: r.mountpoint,
                    source_connected: r.source_connected && r.data_flowing,
                    clients_connected: r.subscriber_count,
                })
                .collect(),
        }
    }

    pub fn active_rover_sessions(&self) -> Vec<RoverSessionDto> {
        self.supervisor.active_rover_sessions().into_iter().map(RoverSessionDto::from).collect()
    }

    pub async fn probe_source(&self, host: &str, port: u16, user: Option<&str>, pass: Option<&str>) -> Result<Vec<proto::sourcetable::MountpointInfo>, CoreError> {
        self.supervisor.probe_source(host, port, user, pass).await
    }

    pub async fn station_status(&self, station_id: &str) -> Result<Option<StationStatusDto>, CoreError> {
        Ok(self.supervisor.station_status(station_id).await?.map(StationStatusDto::from))
    }
}
