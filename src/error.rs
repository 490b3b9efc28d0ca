//! Error types for the consolidation service

use thiserror::Error;

/// Unified error type for store, parser, consolidation and export operations
#[derive(Debug, Error)]
pub enum InventoryError {
    /// Uploaded file is malformed or lacks required columns
    #[error("schema error in {file}: {reason}")]
    Schema { file: String, reason: String },

    /// No valid input; the master is left as it was
    #[error("consolidation failed: {0}")]
    Consolidation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Artifact encoding failed
    #[error("render error: {0}")]
    Render(String),

    /// File is being read by a running consolidation
    #[error("file {0} is in use by a running consolidation, retry later")]
    Busy(String),

    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    /// Rejected settings update
    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Blocking worker panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl InventoryError {
    pub fn schema(file: impl Into<String>, reason: impl Into<String>) -> Self {
        InventoryError::Schema {
            file: file.into(),
            reason: reason.into(),
        }
    }

    pub fn render(err: impl std::fmt::Display) -> Self {
        InventoryError::Render(err.to_string())
    }
}

/// Why a single row was left out of a candidate set
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowErrorKind {
    EmptyKey,
    NonNumericQuantity { value: String },
    NegativeQuantity { value: String },
    InvalidTimestamp { value: String },
}

/// Non-fatal, per-row parse failure. Collected and counted as "rejected".
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize)]
#[error("row {row}: {}", describe(.kind))]
pub struct RowError {
    /// 1-based row number as shown by a spreadsheet program
    pub row: usize,
    #[serde(flatten)]
    pub kind: RowErrorKind,
}

fn describe(kind: &RowErrorKind) -> String {
    match kind {
        RowErrorKind::EmptyKey => "empty item code".to_string(),
        RowErrorKind::NonNumericQuantity { value } => format!("quantity {:?} is not a number", value),
        RowErrorKind::NegativeQuantity { value } => format!("quantity {} is negative", value),
        RowErrorKind::InvalidTimestamp { value } => format!("unrecognised date {:?}", value),
    }
}

/// Result alias for service operations
pub type Result<T> = std::result::Result<T, InventoryError>;
