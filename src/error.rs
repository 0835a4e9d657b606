use std::path::{Path, PathBuf};

use thiserror::Error;

/// The primary error type for all fatal conditions in the `distpack` crate.
///
/// Per-entry conditions that do not abort a run (skipped or vanished entries)
/// are not errors; they are collected as [`EntryError`] values instead.
#[derive(Error, Debug)]
pub enum PackError {
    /// The source root could not be stat'd or listed. Nothing has been written yet.
    #[error("source directory '{}' is unreadable: {source}", .path.display())]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An I/O fault while reading a source entry or writing the destination archive.
    #[error("archive I/O error on path '{}': {source}", .path.display())]
    ArchiveIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The zip container rejected an entry or could not be finalized.
    #[error("zip container error while writing '{}': {source}", .path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    /// The version counter could not be written back. The archive itself is valid.
    #[error("archive was written but the version counter in '{}' was not updated: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest changed under the run and the counter could not be written into it.
    /// The archive itself is valid.
    #[error("archive was written but the version counter in '{}' was not updated: {source}", .path.display())]
    PersistManifest {
        path: PathBuf,
        #[source]
        source: Box<PackError>,
    },

    /// The project manifest could not be read.
    #[error("could not read manifest '{}': {source}", .path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The project manifest is not valid JSON.
    #[error("manifest '{}' is not valid JSON: {source}", .path.display())]
    ManifestFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The manifest parsed, but a section has an unexpected shape.
    #[error("manifest '{}' is malformed: {reason}", .path.display())]
    ManifestShape { path: PathBuf, reason: String },

    /// The operator interrupted the run.
    #[error("interrupted before the archive was finalized")]
    Interrupted,

    /// A spawned task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl PackError {
    /// The path this error occurred at, if applicable.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::RootUnreadable { path, .. }
            | Self::ArchiveIo { path, .. }
            | Self::Zip { path, .. }
            | Self::Persist { path, .. }
            | Self::PersistManifest { path, .. }
            | Self::Manifest { path, .. }
            | Self::ManifestFormat { path, .. }
            | Self::ManifestShape { path, .. } => Some(path),
            Self::Interrupted | Self::Task(_) => None,
        }
    }

    /// True when the archive exists on disk but the ledger did not advance.
    pub fn is_persist(&self) -> bool {
        matches!(self, Self::Persist { .. } | Self::PersistManifest { .. })
    }

    pub(crate) fn archive_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ArchiveIo { path: path.into(), source }
    }
}

impl From<tokio::task::JoinError> for PackError {
    fn from(err: tokio::task::JoinError) -> Self {
        PackError::Task(err.to_string())
    }
}

/// A non-fatal failure on a single entry, recorded and reported after the walk.
#[derive(Debug)]
pub struct EntryError {
    pub path: PathBuf,
    pub cause: std::io::Error,
}

impl EntryError {
    pub fn new(path: impl Into<PathBuf>, cause: std::io::Error) -> Self {
        Self { path: path.into(), cause }
    }
}

impl std::fmt::Display for EntryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.cause)
    }
}
