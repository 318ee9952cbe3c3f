//! Crate-wide error type.
//!
//! Only [`Error::Config`] is meant to unwind out of `main`; every other
//! variant is logged and folded into a run counter inside the worker loop.

use std::fmt;
use std::path::PathBuf;

/// The unified error type returned by fallible operations across the engine.
#[derive(Debug)]
pub enum Error {
    /// Bad command line, unreadable seed directory, or other startup
    /// misconfiguration. Fatal.
    Config(String),
    /// Scratch-file write, artifact rename, or other filesystem failure.
    Io(std::io::Error),
    /// `fork`/`exec` failed, or a `nix` syscall the launch path depends on
    /// returned an error.
    Launch(String),
    /// A [`crate::feedback::FeedbackBackend`] failed to prepare or attach.
    Backend(String),
    /// Failed to serialize a report or corpus entry.
    Serialize(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(s) => write!(f, "configuration error: {s}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Launch(s) => write!(f, "launch error: {s}"),
            Error::Backend(s) => write!(f, "feedback backend error: {s}"),
            Error::Serialize(s) => write!(f, "serialization error: {s}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Launch(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialize(e.to_string())
    }
}

/// Convenience helper: turn an unreadable path into a [`Error::Config`].
pub fn unreadable(path: &PathBuf, cause: &dyn fmt::Display) -> Error {
    Error::Config(format!("cannot read '{}': {cause}", path.display()))
}

pub type Result<T> = std::result::Result<T, Error>;
