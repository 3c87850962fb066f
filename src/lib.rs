//! kmodd - kernel module metadata cache and dependency-resolving loader.
//!
//! Data flow: module tree -> [`module::ModuleFile`] (metadata extraction)
//! -> [`cache::ModuleCache`] (built once, immutable) -> [`server`] (Unix
//! socket daemon) -> [`client`] query -> [`loader::Loader`] (recursive
//! dependency expansion) -> kernel load syscall.
//!
//! The library is exposed for the `kmodd` binary and for integration tests.

pub mod cache;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod loader;
pub mod module;
pub mod server;
