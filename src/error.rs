//! Crate-wide error taxonomy: configuration diagnostics carry a source
//! location and are collected across a whole parse pass; everything else
//! goes through [`Error`], tagged by the failure classes the daemon
//! actually distinguishes at the main-loop boundary.

use std::path::PathBuf;
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// One diagnostic from the configuration parser, with the file and line it
/// was found at. Parsing keeps going after one of these so a single run
/// reports every mistake instead of just the first.
#[derive(Debug, ThisError)]
#[error("{file}:{line}: {message}")]
pub struct ConfigError {
    pub file: PathBuf,
    pub line: u32,
    pub message: String,
}

impl ConfigError {
    pub fn new(file: impl Into<PathBuf>, line: u32, message: impl Into<String>) -> Self {
        ConfigError {
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}

/// Everything the main loop or setup path can fail with, other than
/// configuration diagnostics (those are collected separately as
/// `Vec<ConfigError>` and reported together).
#[derive(Debug, ThisError)]
pub enum Error {
    /// Watch installation failed for one path; the caller skips that path
    /// and continues rather than treating this as fatal.
    #[error("kernel error watching {path:?}: {source}")]
    Kernel {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A handler failed to fork/exec; the event is otherwise dropped.
    #[error("failed to spawn handler {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A short read or otherwise malformed response from the backend.
    /// Retried once by the caller before becoming fatal.
    #[error("protocol error from backend: {0}")]
    Protocol(String),

    /// Resource exhaustion during setup (e.g. a watch table at its kernel
    /// limit). Fatal: the caller exits with status 2.
    #[error("resource exhaustion: {0}")]
    Exhausted(String),

    /// Configuration parsing failed; carries every diagnostic collected
    /// during the pass.
    #[error("{} configuration error(s)", .0.len())]
    Config(Vec<ConfigError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Clap(#[from] clap::Error),
}
