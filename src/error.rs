//! Error types for Mailman.

use std::time::Duration;

/// Top-level error type for a run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Receiver error: {0}")]
    Receiver(#[from] ReceiverError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Maildir watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Conflicting configuration: {first} and {second} are mutually exclusive")]
    Conflict { first: String, second: String },
}

/// Errors raised by a receiver while connecting, fetching or disconnecting.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("{receiver} network error: {source}")]
    Io {
        receiver: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{receiver} TLS error: {reason}")]
    Tls {
        receiver: &'static str,
        reason: String,
    },

    #[error("{receiver} connect to {server} timed out after {timeout:?}")]
    Timeout {
        receiver: &'static str,
        server: String,
        timeout: Duration,
    },

    #[error("{receiver} command {command} failed: {response}")]
    Protocol {
        receiver: &'static str,
        command: String,
        response: String,
    },

    #[error("{receiver} authentication failed for {username}: {response}")]
    AuthFailed {
        receiver: &'static str,
        username: String,
        response: String,
    },

    #[error("{receiver} is not connected")]
    NotConnected { receiver: &'static str },

    #[error("Message {handle} could not be dispatched: {source}")]
    Dispatch {
        handle: String,
        #[source]
        source: DispatchError,
    },
}

impl ReceiverError {
    /// Whether the poll loop may log this error and retry on the next cycle.
    ///
    /// Network, TLS and protocol faults are retried. Rejected credentials,
    /// dispatch faults and misuse of a closed connection end the run.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Tls { .. } | Self::Timeout { .. } | Self::Protocol { .. }
        )
    }
}

/// Errors returned by a dispatch sink.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("Delivery command `{command}` exited with {status}")]
    CommandFailed { command: String, status: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maildir watcher errors.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Maildir {path} is unusable: {source}")]
    Maildir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Filesystem watcher failed: {0}")]
    Notify(#[from] notify::Error),

    #[error("{failed} maildir message(s) could not be dispatched ({dispatched} succeeded)")]
    Undelivered { failed: usize, dispatched: usize },
}

/// Result type alias for a run.
pub type Result<T> = std::result::Result<T, Error>;
