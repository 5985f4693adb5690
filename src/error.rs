use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading, reshaping or plotting.
#[derive(Error, Debug)]
pub enum DataError {
    // IO and decoding
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed archive: {0}")]
    Format(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Unsupported archive {0:?}, expected .pkl.gz or .json.gz")]
    UnsupportedArchive(PathBuf),

    // Validation
    #[error("Label {label} at sample {index} is outside 0..{classes}")]
    LabelOutOfRange {
        index: usize,
        label: i64,
        classes: usize,
    },

    #[error("Cost sequences differ in length. Train: {train}, Val: {val}")]
    LengthMismatch { train: usize, val: usize },
}

impl DataError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        DataError::Format(msg.into())
    }

    /// Classify an error raised while reading a compressed stream: corrupt or
    /// truncated content is a format problem, anything else stays IO.
    pub(crate) fn from_stream(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => DataError::format("stream truncated"),
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
                DataError::Format(err.to_string())
            }
            _ => DataError::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
