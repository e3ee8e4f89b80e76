//! The crate error taxonomy.

use std::{fmt, io};

/// Errors surfaced by the storage engine.
///
/// Recoverable conditions (duplicate key on insert, missing key on
/// remove/find) are reported through `bool`/`Option` returns instead;
/// everything here is fatal to the current operation.
#[derive(Debug)]
pub enum EngineError {
    Io(io::Error),
    /// The buffer pool could not allocate a page.
    OutOfMemory,
    /// A page fetch found every frame pinned.
    AllPagesPinned,
    /// An index into a page's entry array was out of range.
    OutOfIndex,
    /// An internal page did not contain the expected child pointer.
    OldValueNotExists,
    /// An attempt to delete a page that is still pinned.
    PagePinned,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Io(e) => write!(f, "io error: {}", e),
            EngineError::OutOfMemory => write!(f, "out of memory"),
            EngineError::AllPagesPinned => write!(f, "all page are pinned while printing"),
            EngineError::OutOfIndex => write!(f, "out of index"),
            EngineError::OldValueNotExists => write!(f, "old value not exists"),
            EngineError::PagePinned => write!(f, "Page still in use."),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Io(err)
    }
}
