//! The narrow repository contract, plus the entity types that cross it.
//!
//! The real store (stations, rovers, users, locations) lives outside
//! this workspace; the core only ever sees this trait. [`InMemoryRepository`]
//! is a reference adapter so the binary and integration tests have
//! something to run against — it is not the deliverable, the trait is.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Days since the Unix epoch — enough precision for rover `start_date` /
/// `end_date` comparisons without pulling in a calendar crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Date(pub i64);

impl Date {
    pub fn today() -> Self {
        let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs();
        Self((secs / 86_400) as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StationStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone)]
pub struct Station {
    pub id: String,
    pub mountpoint: String,
    pub description: String,
    pub lat: f64,
    pub lon: f64,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub upstream_mountpoint: String,
    pub upstream_username: Option<String>,
    pub upstream_password: Option<String>,
    pub status: StationStatus,
    pub carrier: String,
    pub nav_system: String,
    pub network: String,
    pub country: String,
}

impl Station {
    /// Check field invariants: mountpoint non-empty, lat/lon in range,
    /// port non-zero.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.mountpoint.trim().is_empty() {
            return Err(CoreError::ConfigurationError("mountpoint name is empty".into()));
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(CoreError::ConfigurationError(format!("latitude {} out of range", self.lat)));
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            return Err(CoreError::ConfigurationError(format!("longitude {} out of range", self.lon)));
        }
        if self.upstream_port == 0 {
            return Err(CoreError::ConfigurationError("upstream port must be in [1, 65535]".into()));
        }
        if self.upstream_host.trim().is_empty() {
            return Err(CoreError::ConfigurationError("upstream host is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RoverStatus {
    Active,
    Inactive,
}

/// A salted, one-way password verifier. Never stores or logs the
/// plaintext password.
#[derive(Debug, Clone)]
pub struct PasswordVerifier {
    salt: [u8; 16],
    hash: [u8; 32],
}

impl PasswordVerifier {
    pub fn new(password: &str) -> Self {
        let mut salt = [0u8; 16];
        rand::rng().fill(&mut salt);
        let hash = Self::digest(&salt, password);
        Self { salt, hash }
    }

    pub fn verify(&self, password: &str) -> bool {
        Self::digest(&self.salt, password) == self.hash
    }

    fn digest(salt: &[u8; 16], password: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone)]
pub struct Rover {
    pub id: String,
    pub username: String,
    pub password: PasswordVerifier,
    pub user_id: String,
    pub station_id: Option<String>,
    pub status: RoverStatus,
    pub start_date: Option<Date>,
    pub end_date: Option<Date>,
    pub last_connection: Option<SystemTime>,
}

impl Rover {
    /// Derived activity state: a pure function of (status, start_date,
    /// end_date, today). Never persisted.
    pub fn is_currently_active(&self, today: Date) -> bool {
        self.status == RoverStatus::Active
            && self.start_date.is_none_or(|d| d <= today)
            && self.end_date.is_none_or(|d| d >= today)
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn station_find_by_id(&self, id: &str) -> Result<Option<Station>, CoreError>;
    async fn station_find_by_name(&self, name: &str) -> Result<Option<Station>, CoreError>;
    async fn station_find_active(&self) -> Result<Vec<Station>, CoreError>;
    async fn station_update_status(&self, id: &str, status: StationStatus) -> Result<(), CoreError>;
    async fn rover_find_by_username(&self, username: &str) -> Result<Option<Rover>, CoreError>;
    async fn rover_touch_last_connection(&self, id: &str, time: SystemTime) -> Result<(), CoreError>;
}

/// Reference in-memory `Repository` used by the binary's default wiring
/// and by the integration tests. A real deployment swaps this for a
/// SQL-backed adapter; nothing else in this workspace depends on that
/// choice.
#[derive(Default)]
pub struct InMemoryRepository {
    stations: RwLock<HashMap<String, Station>>,
    rovers: RwLock<HashMap<String, Rover>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_station(&self, station: Station) {
        self.stations.write().insert(station.id.clone(), station);
    }

    pub fn insert_rover(&self, rover: Rover) {
        self.rovers.write().insert(rover.id.clone(), rover);
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn station_find_by_id(&self, id: &str) -> Result<Option<Station>, CoreError> {
        Ok(self.stations.read().get(id).cloned())
    }

    async fn station_find_by_name(&self, name: &str) -> Result<Option<Station>, CoreError> {
        Ok(self.stations.read().values().find(|s| s.mountpoint == name).cloned())
    }

    async fn station_find_active(&self) -> Result<Vec<Station>, CoreError> {
        Ok(self
            .stations
            .read()
            .values()
            .filter(|s| s.status == StationStatus::Active)
            .cloned()
            .collect())
    }

    async fn station_update_status(&self, id: &str, status: StationStatus) -> Result<(), CoreError> {
        match self.stations.write().get_mut(id) {
            Some(station) => {
                station.status = status;
                Ok(())
            }
            None => Err(CoreError::NotFound(id.to_string())),
        }
    }

    async fn rover_find_by_username(&self, username: &str) -> Result<Option<Rover>, CoreError> {
        Ok(self.rovers.read().values().find(|r| r.username == username).cloned())
    }

    async fn rover_touch_last_connection(&self, id: &str, time: SystemTime) -> Result<(), CoreError> {
        if let Some(rover) = self.rovers.write().get_mut(id) {
            rover.last_connection = Some(time);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rover(status: RoverStatus, start: Option<i64>, end: Option<i64>) -> Rover {
        Rover {
            id: "r1".into(),
            username: "rover1".into(),
            password: PasswordVerifier::new("rover123"),
            user_id: "u1".into(),
            station_id: None,
            status,
            start_date: start.map(Date),
            end_date: end.map(Date),
            last_connection: None,
        }
    }

    #[test]
    fn password_verifier_round_trips() {
        let v = PasswordVerifier::new("rover123");
        assert!(v.verify("rover123"));
        assert!(!v.verify("wrong"));
    }

    #[test]
    fn expired_rover_is_not_effectively_active() {
        let today = Date(100);
        let r = rover(RoverStatus::Active, None, Some(99));
        assert!(!r.is_currently_active(today));
    }

    #[test]
    fn unbounded_active_rover_is_effectively_active() {
        let today = Date(100);
        let r = rover(RoverStatus::Active, None, None);
        assert!(r.is_currently_active(today));
    }

    #[test]
    fn inactive_status_overrides_date_window() {
        let today = Date(100);
        let r = rover(RoverStatus::Inactive, Some(1), Some(1000));
        assert!(!r.is_currently_active(today));
    }

    #[test]
    fn station_validation_rejects_bad_fields() {
        let mut s = Station {
            id: "s1".into(),
            mountpoint: "VRS01".into(),
            description: "".into(),
            lat: 21.0285,
            lon: 105.8542,
            upstream_host: "upstream.example".into(),
            upstream_port: 2101,
            upstream_mountpoint: "RTCM3".into(),
            upstream_username: None,
            upstream_password: None,
            status: StationStatus::Active,
            carrier: "2".into(),
            nav_system: "GPS+GLO".into(),
            network: "CORS".into(),
            country: "VNM".into(),
        };
        assert!(s.validate().is_ok());

        s.lat = 200.0;
        assert!(s.validate().is_err());
    }
}
