//! Daemon error type.
//!
//! Startup failures carry enough detail to name the failing step in the
//! log; the supervisor process itself only ever exits 0 or 1. The
//! granular exit codes in [`crate::config`] belong to the worker side of
//! the restart-policy contract, not to this type.

use std::path::PathBuf;

use ferry_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// Directory verification failed at a numbered startup step.
    #[error("cannot set up {path} (step {step}): {source}")]
    Dirs {
        path: PathBuf,
        step: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("command channel: {0}")]
    Fifo(std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
