//! Error types for the query-execution service

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Malformed request: {0}")]
    Decode(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Request queue is full")]
    QueueFull,

    #[error("Config error: {0}")]
    Config(String),
}

impl ServerError {
    /// Get the error-kind string used on the wire.
    ///
    /// Only kinds a client can receive are distinguished; everything
    /// else collapses to `InternalError` (those responses are normally
    /// logged and dropped rather than sent).
    pub fn wire_kind(&self) -> &'static str {
        match self {
            ServerError::Query(_) => "SQLException",
            ServerError::QueueFull => "ServerBusy",
            _ => "InternalError",
        }
    }
}
