//! Error types for the tag index engine.
//!
//! Validation problems are rejected before any statement runs, consistency
//! problems abort initialization or the current ingestion batch, and storage
//! errors are passed through from SQLite.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Caller supplied something the engine refuses to query with.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The catalog or an upsert is in a state that must not be built upon.
    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The classifier collaborator failed for a batch.
    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency(message.into())
    }

    /// True for errors caused by the caller rather than the store.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
