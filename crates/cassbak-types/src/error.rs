use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file modified: {path}: expected {expected}, actual {actual}")]
    FingerprintMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("digest mismatch: expected={expected} actual={actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid manifest key")]
    InvalidManifestKey,

    #[error("invalid manifest type: {0}")]
    InvalidManifestType(u8),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("{} parts failed to upload", .0.len())]
    UploadPartFailures(Vec<(u16, String)>),

    #[error("{} files failed", .0.len())]
    FileErrors(Vec<(String, String)>),

    #[error("no snapshots found for host")]
    NoSnapshotsFound,

    #[error("no backups found for host")]
    NoBackupsFound,

    #[error("file changes detected")]
    ChangesDetected,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors that must never be retried against the bucket.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_fingerprint_mismatch(&self) -> bool {
        matches!(self, Error::FingerprintMismatch { .. })
    }
}
