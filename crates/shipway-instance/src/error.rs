use shipway_state::HealthStatus;

pub type InstanceResult<T> = Result<T, InstanceError>;

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("failed to start instance: {0}")]
    Start(String),

    #[error("cutover to {instance} rejected: health is {health:?}")]
    NotHealthy {
        instance: String,
        health: HealthStatus,
    },

    #[error("a cutover is already in progress")]
    CutoverInProgress,

    #[error("instance {0} is not running")]
    NotRunning(String),

    #[error("unknown instance: {0}")]
    Unknown(String),

    #[error("instance {instance} has an invalid address {address}")]
    BadAddress { instance: String, address: String },

    #[error("failed to signal instance {instance}: {reason}")]
    Signal { instance: String, reason: String },
}
