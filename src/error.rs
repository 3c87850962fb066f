//! Error kinds for cache generation, resolution, loading and IPC.
//!
//! The distinctions matter operationally: a `Scan` failure keeps the daemon
//! from ever serving, a `NotFound` is a normal outcome for dependency
//! resolution, and only a `Load` on the final target fails the operation.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The scan root or a module file under it could not be read during
    /// cache generation. Aborts the whole generation.
    #[error("module scan failed at {path}: {source}")]
    Scan { path: PathBuf, source: io::Error },

    /// A module file could not be opened or mapped for metadata extraction.
    #[error("cannot read module metadata from {path}: {source}")]
    Metadata { path: PathBuf, source: io::Error },

    /// The name or alias is absent from the cache. Built-in modules are
    /// invisible to the cache, so callers resolving dependencies must
    /// tolerate this.
    #[error("module '{0}' not found in cache")]
    NotFound(String),

    /// The kernel rejected the load for a reason other than "already
    /// loaded".
    #[error("kernel refused to load {path}: {source}")]
    Load { path: PathBuf, source: io::Error },

    /// Socket-level failure talking to or serving a client.
    #[error("ipc failure: {0}")]
    Ipc(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
