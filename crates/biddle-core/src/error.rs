//! Error types for biddle operations.
//! Every fatal variant names the operation that failed and the underlying cause.

use std::io;
use std::path::Path;

use thiserror::Error;

/// Main error type for biddle operations
#[derive(Debug, Error)]
pub enum BiddleError {
    /// package.json missing, malformed, or lacking name/version
    #[error("Invalid package descriptor {path}: {reason}")]
    DescriptorInvalid { path: String, reason: String },

    /// Republish at a version already present in the published catalog
    #[error("Attempted to publish {name} over existing version {version}")]
    DuplicateVersion { name: String, version: String },

    /// Target version already installed
    #[error(
        "{name} is already installed at version {version}. To continue uninstall the application and try again: biddle uninstall {name}"
    )]
    AlreadyInstalled { name: String, version: String },

    /// Downloaded archive does not match its sidecar digest
    #[error(
        "Hashes don't match for {location}. File is saved in the downloads directory and will not be installed.\nGenerated hash - {actual}\nRequested hash - {expected}"
    )]
    HashMismatch {
        location: String,
        expected: String,
        actual: String,
    },

    /// Missing catalog entry or resource
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("filepath {path} is not a file")]
    NotAFile { path: String },

    #[error(
        "{path} does not appear to be a package archive. Install expects an archive and a hash file at the same location and file name"
    )]
    NotPackageArchive { path: String },

    /// I/O related errors
    #[error("I/O error in {operation}: {source} (path: {path})")]
    Io {
        operation: &'static str,
        path: String,
        source: io::Error,
    },

    /// Network/HTTP errors
    #[error("Network error in {operation}: {reason} (url: {url})")]
    Network {
        operation: &'static str,
        url: String,
        reason: String,
    },

    /// Catalog, history, or config JSON that could not be read or written
    #[error("Catalog error in {operation}: {source} (path: {path})")]
    Catalog {
        operation: &'static str,
        path: String,
        source: serde_json::Error,
    },

    /// Archive tool failures
    #[error("Archive error in {operation}: {reason} (path: {path})")]
    Archive {
        operation: &'static str,
        path: String,
        reason: String,
    },

    /// Variant pre-package task failure; logged, never fatal to a publish
    #[error("Task failed for variant {variant}: `{command}`: {reason}")]
    Task {
        variant: String,
        command: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, BiddleError>;

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Operation completed but with issues
    Warning,
    /// Session failed without side effects
    Rejected,
    /// Session aborted
    Fatal,
}

impl BiddleError {
    pub fn io(operation: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        BiddleError::Io {
            operation,
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn catalog(operation: &'static str, path: impl AsRef<Path>, source: serde_json::Error) -> Self {
        BiddleError::Catalog {
            operation,
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn network(operation: &'static str, url: &str, reason: impl ToString) -> Self {
        BiddleError::Network {
            operation,
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            BiddleError::Task { .. } => ErrorSeverity::Warning,
            BiddleError::AlreadyInstalled { .. } | BiddleError::NotFound { .. } => {
                ErrorSeverity::Rejected
            }
            _ => ErrorSeverity::Fatal,
        }
    }

    /// True for an I/O error whose cause is a missing path.
    pub fn is_missing_path(&self) -> bool {
        matches!(self, BiddleError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Attach an operation name and path to a std::io::Result.
pub trait IoContext<T> {
    fn io_context(self, operation: &'static str, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, io::Error> {
    fn io_context(self, operation: &'static str, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| BiddleError::io(operation, path, e))
    }
}
