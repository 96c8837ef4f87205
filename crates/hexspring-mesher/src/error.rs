//! Error types for the mesher driver.

use thiserror::Error;

/// Errors that can unwind out of a pipeline stage.
#[derive(Error, Debug)]
pub enum MesherError {
    /// The reporter asked us to stop; not a failure.
    #[error("stopped by request")]
    Stopped,

    /// I/O error on a stage file or input.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed surface or stream input.
    #[error(transparent)]
    Surface(#[from] hexspring_surface::SurfaceError),

    /// The grid failed verification.
    #[error("grid invariant violated: {0}")]
    Invariant(String),
}

/// Result type for mesher operations.
pub type Result<T> = std::result::Result<T, MesherError>;

/// Outcome of a full pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Completed, or stopped on request.
    NoErr,
    /// Something unexpected went wrong; details are in the log.
    UnknownErr,
}
