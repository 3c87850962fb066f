//! Recursive, best-effort dependency resolution and module loading.
//!
//! The kernel surface (the load primitive and the live loaded-module list)
//! sits behind the [`Kernel`] trait so the loading policy can be exercised
//! without root and without a real kernel.

use std::ffi::CString;
use std::fs;
use std::io;

use log::{error, info, warn};

use crate::cache::{names_equal, ModuleCache, ModuleRecord};
use crate::error::{Error, Result};
use crate::module::ModuleFile;

/// Outcome of a successful load call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded,
    /// The kernel reported the module as already present. Success.
    AlreadyLoaded,
}

/// The kernel-facing surface consumed by the loader.
pub trait Kernel {
    /// Hand a module image to the kernel. "Already loaded" is a success
    /// variant, not an error.
    fn load_module(&self, image: &[u8], params: &str) -> io::Result<LoadStatus>;

    /// Whether the live loaded-module list names this module.
    fn is_loaded(&self, name: &str) -> bool;
}

/// The real thing: init_module(2) plus /proc/modules.
pub struct LinuxKernel;

impl Kernel for LinuxKernel {
    fn load_module(&self, image: &[u8], params: &str) -> io::Result<LoadStatus> {
        let params = CString::new(params).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "NUL byte in module parameters")
        })?;
        // SAFETY: the kernel copies both the image and the parameter string
        // before the call returns; neither is retained.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_init_module,
                image.as_ptr(),
                image.len() as libc::c_ulong,
                params.as_ptr(),
            )
        };
        if rc == 0 {
            return Ok(LoadStatus::Loaded);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EEXIST) {
            Ok(LoadStatus::AlreadyLoaded)
        } else {
            Err(err)
        }
    }

    fn is_loaded(&self, name: &str) -> bool {
        let Ok(listing) = fs::read_to_string("/proc/modules") else {
            return false;
        };
        listing
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|loaded| names_equal(loaded, name))
    }
}

/// Resolves identifiers through the cache and drives the kernel load,
/// dependencies first.
pub struct Loader<'c, K: Kernel> {
    cache: &'c ModuleCache,
    kernel: K,
}

impl<'c, K: Kernel> Loader<'c, K> {
    pub fn new(cache: &'c ModuleCache, kernel: K) -> Self {
        Self { cache, kernel }
    }

    /// Resolve `identifier` (as a name first, as an alias second) and load
    /// it, recursively loading its declared dependencies first when
    /// `with_dependencies` is set.
    ///
    /// `params` applies to the target module only; dependencies are always
    /// loaded without parameters.
    pub fn load(&self, identifier: &str, params: &str, with_dependencies: bool) -> Result<()> {
        let record = self
            .cache
            .resolve(identifier)
            .ok_or_else(|| Error::NotFound(identifier.to_string()))?;
        self.load_record(record, params, with_dependencies)
    }

    fn load_record(
        &self,
        record: &ModuleRecord,
        params: &str,
        with_dependencies: bool,
    ) -> Result<()> {
        if record.is_blacklisted() {
            info!("{} is blacklisted, not loading", record.name());
            return Ok(());
        }
        if self.kernel.is_loaded(record.name()) {
            return Ok(());
        }

        let module = ModuleFile::open(record.path())?;
        if with_dependencies {
            self.load_dependencies(&module)?;
        }

        info!("loading {}", record.name());
        match self.kernel.load_module(module.image(), params) {
            Ok(_) => Ok(()),
            Err(source) => {
                error!("failed to load {}: {}", record.name(), source);
                Err(Error::Load {
                    path: record.path().to_path_buf(),
                    source,
                })
            }
        }
    }

    /// Load each `depends=` entry by name, recursively.
    ///
    /// Dependency metadata routinely names built-in modules that never
    /// appear in the cache, so a resolution miss is logged and skipped; a
    /// dependency that resolves but fails to load propagates. Dependency
    /// graphs are assumed acyclic: the toolchain that embeds `depends=`
    /// orders them that way, and no cycle guard exists here.
    fn load_dependencies(&self, module: &ModuleFile) -> Result<()> {
        for dependency in module.dependencies() {
            match self.load(&dependency, "", true) {
                Ok(()) => {}
                Err(Error::NotFound(name)) => {
                    warn!(
                        "{}: dependency {} not in cache, skipping",
                        module.name(),
                        name
                    );
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }
}
