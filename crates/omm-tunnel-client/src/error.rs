//! Client errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Dispatch driver stopped")]
    DriverStopped,

    #[error("Dispatch driver task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
