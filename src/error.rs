//! Error types for the replicated cache.

use crate::types::{LogIndex, Term};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for replicated cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the replicated cache.
#[derive(Error, Debug)]
pub enum Error {
    /// A locally applied change could not be replicated or committed.
    ///
    /// Raised inside the write path only. The engine rolls back and retries
    /// on this error, so callers never observe it from `set`/`remove`/`refresh`.
    #[error("replication failed: {0}")]
    Replication(#[from] ReplicationError),

    /// The leader answered a relayed change with something other than `OK`.
    #[error("leader rejected {operation} of '{key}': {reply}")]
    Redirection {
        operation: String,
        key: String,
        reply: String,
    },

    /// No leader was elected within the wait window.
    #[error("no leader elected after {waited:?}, impossible to apply the change")]
    LeaderDiscoveryTimeout { waited: Duration },

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Log storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The request can never succeed as given.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The component is shutting down and no longer hands out locks.
    #[error("shutting down")]
    ShuttingDown,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// A cache change ended without being accepted.
    ///
    /// `last_index` is the log index of the latest local attempt, `0` when
    /// the change never reached the local log.
    #[error("{operation} of '{key}' failed in term {term} (last index {last_index}): {source}")]
    Change {
        operation: String,
        key: String,
        term: Term,
        last_index: LogIndex,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether the write path should roll back and retry on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Replication(_))
    }

    /// The underlying error, without change context.
    pub fn root(&self) -> &Error {
        match self {
            Error::Change { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }

    /// Turn a failure of the replication window into a retryable error.
    ///
    /// Cancellation and errors that already are replication errors pass
    /// through unchanged.
    pub fn into_replication(self, index: LogIndex, term: Term) -> Error {
        match self {
            Error::Cancelled | Error::Replication(_) => self,
            other => ReplicationError::Failed {
                index,
                term,
                reason: other.to_string(),
            }
            .into(),
        }
    }
}

/// Reasons a locally appended entry did not become durable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// Forced replication reported failure or timed out.
    #[error("log entry #{index} was not replicated in term {term}")]
    NotReplicated { index: LogIndex, term: Term },

    /// Leadership changed while the entry was being replicated.
    #[error("term changed from {from} to {to} while replicating entry #{index}")]
    TermChanged { index: LogIndex, from: Term, to: Term },

    /// The entry was replicated but did not commit in time.
    #[error("commit of log entry #{index} unsuccessful in term {term}")]
    CommitTimeout { index: LogIndex, term: Term },

    /// The entry was dropped and its index now holds another writer's entry.
    #[error("log entry #{index} was superseded by another entry in term {term}")]
    Superseded { index: LogIndex, term: Term },

    /// The log or the replicator failed while the entry was in flight.
    #[error("replication of log entry #{index} failed in term {term}: {reason}")]
    Failed {
        index: LogIndex,
        term: Term,
        reason: String,
    },
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Request timed out.
    #[error("request to {addr} timed out after {after:?}")]
    Timeout { addr: String, after: Duration },

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Address parse error.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Log storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Log compacted, entry no longer available.
    #[error("log compacted at index {0}")]
    Compacted(LogIndex),

    /// New entries do not continue the existing log.
    #[error("log gap: last index {last_index}, first new {first_new}")]
    LogGap { last_index: LogIndex, first_new: LogIndex },
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}
