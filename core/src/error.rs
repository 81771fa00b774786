use thiserror::Error;

/// Every failure the engine can surface.
///
/// Low-level code only ever produces `Disk` and `Internal`; the semantic
/// variants (`NoFile`, `Exists`, `Denied`, ...) are raised by the policy
/// layers that understand paths and access modes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("disk I/O error: {0}")]
    Disk(String),

    #[error("internal filesystem error: {0}")]
    Internal(&'static str),

    #[error("drive not ready")]
    NotReady,

    #[error("volume is write protected")]
    WriteProtected,

    #[error("no such file")]
    NoFile,

    #[error("path not found")]
    NoPath,

    #[error("invalid path name")]
    InvalidName,

    #[error("object already exists")]
    Exists,

    #[error("invalid handle (stale mount or closed volume)")]
    InvalidObject,

    #[error("access denied")]
    Denied,

    #[error("no work area for the volume")]
    NotEnabled,

    #[error("invalid drive")]
    InvalidDrive,

    #[error("no recognizable filesystem on the device")]
    NoFilesystem,

    #[error("volume creation aborted")]
    MkfsAborted,

    #[error("could not take control of the volume within the deadline")]
    Timeout,

    #[error("object is locked by another open")]
    Locked,

    #[error("too many open objects")]
    TooManyOpenFiles,

    #[error("name buffer allocation failed")]
    NotEnoughCore,

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Disk(e.to_string())
    }
}
