//! The concurrent NTRIP relay engine: Source Client, Caster Server, and
//! the Relay Supervisor that bridges them to an external Repository.

pub mod caster;
pub mod error;
pub mod repository;
pub mod session;
pub mod source;
pub mod supervisor;

pub use caster::{CasterConfig, CasterServer};
pub use error::{CoreError, CoreResult};
pub use repository::{
    Date, InMemoryRepository, PasswordVerifier, Repository, Rover, RoverStatus, Station, StationStatus,
};
pub use session::{PositionReport, RoverSessionHandle, RoverSessionSnapshot, DATA_LIVENESS_WINDOW};
pub use source::{SourceClient, SourceObserver, SourceStats, UpstreamTarget};
pub use supervisor::{RelayStatus, RelaySupervisor, StartOutcome, StationStatusView, SupervisorStatus};
