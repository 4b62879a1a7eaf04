//! Unified error types for the core.
//!
//! The taxonomy distinguishes failures the job queue absorbs internally
//! (transient transport errors) from failures that surface exactly once
//! through the event channel and persisted state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error type.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    #[error("Database error: {0}")]
    Sql(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not a member of the group")]
    NotInGroup,

    #[error("Another ongoing process is already running")]
    Ongoing,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Chat not found: {0}")]
    NoChat(u32),

    #[error("Message not found: {0}")]
    NoMessage(u32),

    #[error("Contact not found: {0}")]
    NoContact(u32),

    #[error("Invalid parameter: {0}")]
    BadParameter(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Sql(e.to_string())
    }
}

impl From<r2d2::Error> for Error {
    fn from(e: r2d2::Error) -> Self {
        Error::Sql(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
