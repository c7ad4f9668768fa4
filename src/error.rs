use thiserror::Error;

#[derive(Error, Debug)]
pub enum DroneManagerError {
    #[error("No drones available for placement")]
    NoDronesAvailable,

    #[error("Unknown drone: {0}")]
    UnknownDrone(String),

    #[error("Pidfile {0} has no known process to pin execution to")]
    PinnedProcessUnknown(String),

    #[error("Drone {hostname} has stale queued calls before refresh: {calls}")]
    StaleQueuedCalls { hostname: String, calls: String },

    #[error("Transport failure on {hostname}: {message}")]
    Transport { hostname: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DroneManagerError>;
