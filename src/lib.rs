pub mod capacity;
pub mod config;
pub mod drone;
pub mod error;
pub mod manager;
pub mod pidfile;
pub mod registry;

pub use config::{DroneConfig, ManagerConfig};
pub use drone::{DroneCall, DroneTransport, ProcessRow, RefreshBundle};
pub use error::{DroneManagerError, Result};
pub use manager::{DroneManager, ExecuteRequest, WORKING_DIRECTORY};
pub use pidfile::{PidfileContents, PidfileId, Process};
