//! Common error types for the HA components.

use std::fmt;

/// A specialized Result type for HA operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for HA operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Node error: {0}")]
    Node(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("receive queue overflow")]
    QueueOverflow,
}

impl Error {
    /// Create a new transport error.
    pub fn transport(msg: impl fmt::Display) -> Self {
        Error::Transport(msg.to_string())
    }

    /// Create a new node error.
    pub fn node(msg: impl fmt::Display) -> Self {
        Error::Node(msg.to_string())
    }

    /// Create a new engine error.
    pub fn engine(msg: impl fmt::Display) -> Self {
        Error::Engine(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }
}
