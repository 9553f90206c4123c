//! Error taxonomy for the harvest/load/verify flow
//!
//! Every stage returns [`ArchiveError`] and propagates it untouched. Nothing in
//! this crate retries: compilation, archive I/O and rendering are deterministic,
//! so a second attempt would only hide the defect being reported.

use crate::compare::MismatchError;
use std::path::PathBuf;

/// Coarse classification of an [`ArchiveError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Descriptor input validation failed
    InvalidDescriptor,
    /// Shader source or descriptor was rejected by the compiler
    Compilation,
    /// Archive or shader file could not be read or written
    Io,
    /// Archive is readable but holds no entry for the requested descriptor
    ArchiveMiss,
    /// Submission or readback failed on the backend
    Render,
    /// Live and archive-loaded pipelines rendered different pixels
    Mismatch,
}

/// Errors raised while harvesting, loading, rendering or verifying pipelines
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("invalid pipeline descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("compilation failed for {context}: {message}")]
    Compilation { context: String, message: String },

    #[error("archive I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive {} has no compiled entry for {descriptor} (backend '{backend}')", path.display())]
    ArchiveMiss { descriptor: String, path: PathBuf, backend: String },

    #[error("render probe failed for {pipeline}: {message}")]
    Render { pipeline: String, message: String },

    #[error(transparent)]
    Mismatch(#[from] MismatchError),
}

impl ArchiveError {
    /// Returns the coarse kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            Self::Compilation { .. } => ErrorKind::Compilation,
            Self::Io { .. } => ErrorKind::Io,
            Self::ArchiveMiss { .. } => ErrorKind::ArchiveMiss,
            Self::Render { .. } => ErrorKind::Render,
            Self::Mismatch(_) => ErrorKind::Mismatch,
        }
    }

    pub(crate) fn compilation(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compilation {
            context: context.into(),
            message: message.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub(crate) fn invalid_data(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, message.into()))
    }

    pub(crate) fn render(pipeline: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Render {
            pipeline: pipeline.into(),
            message: message.into(),
        }
    }
}

/// Convenience alias used across the crate
pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;
