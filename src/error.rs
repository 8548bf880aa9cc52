// Copyright (c) Abstract Machines

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Process table refresh failed: {0}")]
    ProcessTable(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Log file not found: {}", .0.display())]
    MissingLog(PathBuf),

    #[error("Log {} line {line}: {reason}", .path.display())]
    LogParse {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}
