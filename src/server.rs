//! The cache-serving daemon.
//!
//! Lifecycle: INIT (bind the endpoint, build the cache once) -> SERVING
//! (one blocking wakeup, one client, one request at a time) ->
//! SHUTTING_DOWN (drop the cache, unlink the socket) -> TERMINATED.
//! A failed INIT never serves; a failed request never kills the loop.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use log::{error, info, warn};

use crate::cache::{load_blacklist, ModuleCache};
use crate::config::MAX_REQUEST_LEN;
use crate::daemon::{self, Fork, SignalWait, Wakeup};
use crate::error::{Error, Result};
use crate::loader::{LinuxKernel, Loader};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Scan root, e.g. `/lib/modules/<release>`.
    pub module_root: PathBuf,
    pub blacklist_path: PathBuf,
    /// When set, a resolved request also triggers the dependency-resolving
    /// load, performed in a forked worker against the inherited cache.
    /// When clear the daemon is a pure resolver.
    pub perform_load: bool,
}

pub struct CacheServer {
    listener: UnixListener,
    socket_path: PathBuf,
    cache: ModuleCache,
    perform_load: bool,
}

impl CacheServer {
    /// INIT: bind the endpoint, then build the cache. Either failure keeps
    /// the daemon out of the serving state for good.
    pub fn init(config: &ServerConfig) -> Result<Self> {
        let listener = UnixListener::bind(&config.socket_path).map_err(Error::Ipc)?;

        let blacklist = load_blacklist(&config.blacklist_path).map_err(|source| Error::Scan {
            path: config.blacklist_path.clone(),
            source,
        })?;

        info!("generating module cache under {}", config.module_root.display());
        let cache = match ModuleCache::generate(&config.module_root, &blacklist) {
            Ok(cache) => cache,
            Err(e) => {
                // Bound but never served: take the endpoint down with us.
                let _ = std::fs::remove_file(&config.socket_path);
                return Err(e);
            }
        };
        info!("cached {} modules", cache.len());

        Ok(Self {
            listener,
            socket_path: config.socket_path.clone(),
            cache,
            perform_load: config.perform_load,
        })
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    /// SERVING: park in the wait primitive, handle exactly one event per
    /// wakeup, loop until SIGTERM. Requests are served strictly one at a
    /// time; only the optional load step is forked off.
    pub fn run(self) -> Result<()> {
        let signals = SignalWait::install(self.listener.as_raw_fd()).map_err(Error::Ipc)?;
        info!("serving on {}", self.socket_path.display());
        loop {
            match signals.wait().map_err(Error::Ipc)? {
                Wakeup::Terminate => break,
                Wakeup::Connection => {}
            }
            // Readiness signals can outnumber pending connections; a miss
            // just sends the loop back to waiting.
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    error!("accept failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.handle_connection(stream) {
                warn!("request aborted: {}", e);
            }
        }
        info!("terminating");
        Ok(())
    }

    /// Accept and serve a single client with blocking I/O. The signal-driven
    /// loop in [`run`](Self::run) layers the wait primitive on top of this
    /// same per-connection handling.
    pub fn serve_once(&self) -> Result<()> {
        let (stream, _) = self.listener.accept().map_err(Error::Ipc)?;
        self.handle_connection(stream)
    }

    /// One client: bounded identifier in, resolved path out (or nothing,
    /// the not-found signal), then an optional forked load.
    fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        let mut request = Vec::new();
        (&mut stream)
            .take((MAX_REQUEST_LEN + 1) as u64)
            .read_to_end(&mut request)
            .map_err(Error::Ipc)?;
        if request.is_empty() || request.len() > MAX_REQUEST_LEN {
            // Drop malformed requests without a reply.
            return Ok(());
        }
        let identifier = String::from_utf8_lossy(&request).into_owned();

        let Some(record) = self.cache.resolve(&identifier) else {
            warn!("failed to locate {}", identifier);
            return Ok(());
        };

        stream
            .write_all(record.path().as_os_str().as_bytes())
            .map_err(Error::Ipc)?;
        drop(stream);

        if self.perform_load {
            self.spawn_load(&identifier);
        }
        Ok(())
    }

    fn spawn_load(&self, identifier: &str) {
        match daemon::fork_worker() {
            Ok(Fork::Parent(_)) => {}
            Ok(Fork::Child) => {
                // The child sees the parent's cache through inherited
                // read-only mappings; nothing is copied.
                let loader = Loader::new(&self.cache, LinuxKernel);
                let code = match loader.load(identifier, "", true) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("{}", e);
                        1
                    }
                };
                // The child must not run atexit handlers inherited from
                // the parent.
                // SAFETY: _exit only terminates the calling process.
                unsafe { libc::_exit(code) };
            }
            Err(e) => error!("failed to fork load worker: {}", e),
        }
    }
}

impl Drop for CacheServer {
    /// SHUTTING_DOWN: the socket file must not outlive the daemon.
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
