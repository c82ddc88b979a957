pub mod canonical;
pub mod classify;
pub mod commands;
pub mod event;
pub mod filter;
pub mod player;
pub mod recorder;
pub mod show;
pub mod sort;
pub mod storage;
pub mod transform;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WcarError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {detail}")]
    Corrupt { path: String, detail: String },

    #[error("{path} is not a capture file (bad magic)")]
    BadMagic { path: String },

    #[error("{path}: unsupported capture version {found}, expected {expected}")]
    BadVersion {
        path: String,
        found: u32,
        expected: u32,
    },

    #[error("unknown canonical id {0}")]
    UnknownCanonical(i64),

    #[error("{0}")]
    Replay(String),
}

impl WcarError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        WcarError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn corrupt(path: &std::path::Path, detail: impl Into<String>) -> Self {
        WcarError::Corrupt {
            path: path.display().to_string(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WcarError>;
