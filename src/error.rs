//! Definition of the crate's error and result types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The library's error enum.
#[derive(Debug, Error)]
pub enum Error {
    /// Path does not exist.
    #[error("path does not exist: '{0:?}'")]
    PathDoesNotExist(PathBuf),
    /// IO error.
    #[error("an io error occurred: '{0}'")]
    Io(#[from] io::Error),
    /// The data within is corrupted.
    #[error("data corrupted: '{0}'")]
    Corruption(String),
    /// Invalid argument was passed by the user.
    #[error("an invalid argument was passed: '{0}'")]
    InvalidArgument(String),
}

impl Error {
    pub(crate) fn corruption<S: Into<String>>(msg: S) -> Error {
        Error::Corruption(msg.into())
    }

    pub(crate) fn invalid_argument<S: Into<String>>(msg: S) -> Error {
        Error::InvalidArgument(msg.into())
    }
}

/// The library's result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Converts an `fst` error into an io error, the only kind the fst
/// crate can realistically surface for in-memory maps.
pub(crate) fn convert_fst_error(e: fst::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}
