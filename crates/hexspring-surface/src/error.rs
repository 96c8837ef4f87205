//! Error types for surface input.

use thiserror::Error;

/// Errors that can occur while reading or preparing a surface model.
#[derive(Error, Debug)]
pub enum SurfaceError {
    /// I/O error reading a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed STL content.
    #[error("STL parse error at line {line}: {message}")]
    Stl {
        /// 1-indexed line (0 for binary files).
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// Malformed model blob in a mesher stream.
    #[error("model stream parse error: {0}")]
    Stream(String),

    /// The surface is unusable for meshing (empty, or open where a
    /// closed surface is required).
    #[error("degenerate surface: {0}")]
    Degenerate(String),
}

impl SurfaceError {
    /// Build an STL parse error.
    pub fn stl(line: usize, message: impl Into<String>) -> Self {
        Self::Stl {
            line,
            message: message.into(),
        }
    }
}

/// Result type for surface operations.
pub type Result<T> = std::result::Result<T, SurfaceError>;
