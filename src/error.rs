use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by tailing, watching, and fan-out.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to watch {path:?}: {source}")]
    Watch {
        path: Option<PathBuf>,
        #[source]
        source: notify::Error,
    },
    #[error("Not a regular file: {0:?}")]
    NotAFile(PathBuf),
    #[error("Broadcast hub has shut down")]
    HubClosed,
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        match err.kind {
            // Runtime event errors should mostly be std::io, keep them as such.
            notify::ErrorKind::Io(io_err) => Error::Io(io_err),
            _ => Error::Watch {
                path: err.paths.first().cloned(),
                source: err,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
