// Error types for setup-time failures.
//
// Nothing in here crosses the correlation engine: a running link test only
// ever produces a verdict. These errors surface while opening channels or
// loading configuration, and the orchestrator folds them into the report.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("invalid channel target '{0}'")]
    InvalidTarget(String),

    #[error("channel '{0}' is not connected")]
    Disconnected(String),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
}
