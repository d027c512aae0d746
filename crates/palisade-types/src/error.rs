//! Workspace-wide error type.

use thiserror::Error;

/// Errors produced by the Palisade core.
#[derive(Debug, Error)]
pub enum PalisadeError {
    /// Event spool (SQLite) read/write failure. Treated as fatal by the
    /// dispatcher worker.
    #[error("event store error: {0}")]
    Store(String),

    /// Insert of an event id that already exists in the spool.
    #[error("duplicate event id: {0}")]
    DuplicateEventId(u64),

    /// Configuration loading or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP transport failure outside the self-healing request loops.
    #[error("transport error: {0}")]
    Transport(String),

    /// The manager rejected our credentials or the token is unusable.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Agent identity storage failure.
    #[error("identity error: {0}")]
    Identity(String),

    /// Module lifecycle or command dispatch failure.
    #[error("module error: {0}")]
    Module(String),
}
