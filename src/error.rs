//! Error taxonomy for the capture/analysis/publication loop

use std::{path::PathBuf, process::ExitStatus, time::Duration};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture program exited with {status}: {stderr}")]
    CaptureFailure { status: ExitStatus, stderr: String },
    #[error("capture program did not finish within {timeout:?}: {stderr}")]
    CaptureTimeout { timeout: Duration, stderr: String },
    #[error("capture directory must contain at least two artifacts, found {found}")]
    InsufficientArtifacts { found: usize },
    #[error("{} holds {len} bytes, which does not decode into an 8x16384 i16 matrix", path.display())]
    Decode { path: PathBuf, len: u64 },
    #[error("malformed wire line: {0}")]
    Protocol(String),
    #[error("could not write to consumer: {0}")]
    PublicationFailure(#[source] std::io::Error),
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("shutdown requested")]
    Shutdown,
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Protocol(value.to_string())
    }
}
