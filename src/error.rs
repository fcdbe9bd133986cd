//! Error types for FrameShare

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for FrameShare operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in FrameShare operations
#[derive(Debug, Error)]
pub enum Error {
    /// Bad name, length or path
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Shared memory object with this name already exists
    #[error("Shared memory '{name}' already exists")]
    AlreadyExists { name: String },

    /// Another server already owns this socket path
    #[error("Server '{name}' already running at {}", path.display())]
    AlreadyRunning { name: String, path: PathBuf },

    /// Missing root, socket or shared memory object
    #[error("{what} not found: {source}")]
    NotFound {
        what: String,
        #[source]
        source: io::Error,
    },

    /// Allocation or OS resource failure
    #[error("Resource exhausted while {what}: {source}")]
    ResourceExhausted {
        what: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure mid-operation or synchronization setup failure
    #[error("Unavailable while {what}: {source}")]
    Unavailable {
        what: String,
        #[source]
        source: io::Error,
    },

    /// Only the creating handle may destroy a shared buffer
    #[error("Handle for '{name}' does not own the shared memory")]
    NotOwner { name: String },
}

impl Error {
    /// Classify an OS error raised while `what` was in progress.
    ///
    /// `EEXIST` is left to callers since only they know the name involved.
    pub(crate) fn from_os(what: impl Into<String>, source: io::Error) -> Self {
        let what = what.into();
        if is_exhaustion(&source) {
            return Error::ResourceExhausted { what, source };
        }
        match source.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                Error::NotFound { what, source }
            }
            _ => Error::Unavailable { what, source },
        }
    }

    pub(crate) fn unavailable(what: impl Into<String>, source: io::Error) -> Self {
        Error::Unavailable {
            what: what.into(),
            source,
        }
    }
}

fn is_exhaustion(err: &io::Error) -> bool {
    use rustix::io::Errno;

    if err.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    let Some(raw) = err.raw_os_error() else {
        return false;
    };
    [Errno::NOMEM, Errno::NOSPC, Errno::MFILE, Errno::NFILE, Errno::AGAIN]
        .contains(&Errno::from_raw_os_error(raw))
}
