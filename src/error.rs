//! Error types for the ShaDa store.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for ShaDa operations.
///
/// Record-level damage is not an error: the reader reports it as
/// [`ReadItem::Malformed`](crate::reader::ReadItem::Malformed) and keeps going.
/// Everything here aborts the current read or write.
#[derive(Debug, Error)]
pub enum ShadaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("E576: Error while reading ShaDa file: {reason} at position {offset}")]
    NotShaDa { offset: u64, reason: String },

    #[error("E886: System error while opening ShaDa file {path} for reading: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Failed to write value: {0}")]
    Unencodable(String),

    #[error("{0}")]
    InvalidOption(String),

    #[error("ShaDa is disabled")]
    Disabled,

    #[error("E138: All {0}.tmp.X files exist, cannot write ShaDa file!")]
    TempFilesExhausted(PathBuf),

    #[error("E137: ShaDa file is not writable: {0}")]
    NotWritable(PathBuf),

    #[error("Failed to create directory {path} for writing ShaDa file: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(
        "Can't rename ShaDa file from {temp} to {target}: {source}. \
         Do not forget to remove {temp} or rename it manually to {target}."
    )]
    Rename {
        temp: PathBuf,
        target: PathBuf,
        source: std::io::Error,
    },
}

impl ShadaError {
    pub(crate) fn not_shada(offset: u64, reason: impl Into<String>) -> Self {
        ShadaError::NotShaDa {
            offset,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ShadaError {
    fn from(e: serde_json::Error) -> Self {
        ShadaError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ShadaError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ShadaError::Serialization(e.to_string())
    }
}

/// Result type for ShaDa operations.
pub type Result<T> = std::result::Result<T, ShadaError>;
