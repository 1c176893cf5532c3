//! Crate error type

use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("EVE log path is not configured")]
    LogPathNotConfigured,

    #[error("could not read {}: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The monitoring supervisor dropped its end of the subscription channel.
    #[error("monitoring supervisor is gone; subscription event not delivered")]
    SupervisorGone,

    /// Every subscription event producer went away while the supervisor was running.
    #[error("subscription event stream closed unexpectedly")]
    EventStreamClosed,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
