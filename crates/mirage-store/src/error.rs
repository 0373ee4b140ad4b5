//! Error types for the store.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the repositories.
///
/// I/O and parse failures propagate unchanged from the filesystem layer;
/// absent files are converted to errors only where absence signals torn
/// state (a header entry pointing at a missing stub directory).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The caller referred to a resource that does not exist.
    #[error("{0}")]
    MissingResource(String),

    /// The advisory-lock retry budget was exhausted.
    #[error("failed to acquire lock on {}", path.display())]
    LockContention { path: PathBuf },

    /// Underlying filesystem failure.
    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file on disk is not the JSON we wrote.
    #[error("corrupt JSON in {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Parse {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn missing_stub(index: usize) -> Self {
        Self::MissingResource(format!("no stub at index {index}"))
    }
}
