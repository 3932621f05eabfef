use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Verification failed: {0}")]
    Verification(String),
    #[error("Entry not found in package: {0}")]
    EntryNotFound(String),
    #[error("Installation error: {0}")]
    Installation(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, UpdaterError>;
