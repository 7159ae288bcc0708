//! Error handling.

use std::error::Error as StdError;
use std::io;

use displaydoc::Display;

pub type CoreResult<T> = Result<T, CoreError>;

/// An error.
#[derive(Debug, Display)]
pub enum CoreError {
    /// Invalid tenant id "{pnum}": {reason}
    InvalidTenant { pnum: String, reason: &'static str },

    /// Invalid filename "{name}": {reason}
    InvalidFilename { name: String, reason: &'static str },

    /// I/O error: {error}.
    IoError { error: io::Error },
}

impl CoreError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidTenant { .. } => "InvalidTenant",
            Self::InvalidFilename { .. } => "InvalidFilename",
            Self::IoError { .. } => "IoError",
        }
    }
}

impl StdError for CoreError {}

impl From<io::Error> for CoreError {
    fn from(error: io::Error) -> Self {
        Self::IoError { error }
    }
}
