use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeGateError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into NodeGateError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Missing or malformed request data. Maps to 400.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unknown node key, wrong enrollment secret, unknown carve session.
    /// Maps to 403 without detail about which check failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A referenced entity does not exist. Maps to 404, distinguished
    /// from validation errors.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}
