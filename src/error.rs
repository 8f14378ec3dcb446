//! Error types for the control plane.
//!
//! Only infrastructure failures live here.  Expected negative outcomes of
//! provisioning (no capacity, amount reached, ...) are values, see
//! [`crate::worker::Rejection`].

/// State store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    Duplicate(String),

    #[error("record {0} not found")]
    NotFound(String),
}

/// Container daemon failures.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Transport or daemon error reported by the Docker API client
    #[error("docker api error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("node {node} unreachable: {reason}")]
    Unreachable { node: String, reason: String },
}

/// Intent channel failures.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("topic {0} is closed")]
    Closed(String),

    #[error("topic {0} already has a subscriber")]
    AlreadySubscribed(String),

    #[error("unknown topic {0}")]
    UnknownTopic(String),

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Umbrella error for reconciliation and provisioning.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub type Result<T> = std::result::Result<T, Error>;
