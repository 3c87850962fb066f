//! The in-memory module cache.
//!
//! One ordered record per `.ko` file found under the scan root, built
//! exactly once per daemon lifetime. Lookups are linear scans: module
//! counts are in the hundreds and queries are infrequent, so nothing
//! fancier pays for itself.

use std::collections::HashSet;
use std::ffi::CStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use glob::Pattern;
use log::warn;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::module::ModuleFile;

/// Root of the per-release module trees.
pub const MODULE_DIRECTORY: &str = "/lib/modules";

/// File-name pattern identifying module object files.
const MODULE_FILE_PATTERN: &str = "*.ko";

/// One cached module: canonical name, absolute path and pre-compiled alias
/// patterns, in registration order.
pub struct ModuleRecord {
    name: String,
    path: PathBuf,
    patterns: Vec<Pattern>,
    blacklisted: bool,
}

impl ModuleRecord {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blacklisted modules still resolve; the loader treats them as a
    /// successful no-op.
    pub fn is_blacklisted(&self) -> bool {
        self.blacklisted
    }
}

/// The cache proper: an ordered sequence of records. Immutable once built.
pub struct ModuleCache {
    records: Vec<ModuleRecord>,
}

impl ModuleCache {
    /// Walk `root` depth-first and record every `*.ko` file.
    ///
    /// All-or-nothing: any walk error or unreadable module file aborts the
    /// generation and discards everything accumulated so far. A partially
    /// built cache is never observable.
    pub fn generate(root: &Path, blacklist: &HashSet<String>) -> Result<Self> {
        let matcher = Pattern::new(MODULE_FILE_PATTERN).map_err(|e| Error::Scan {
            path: root.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        let mut records = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf());
                Error::Scan {
                    path,
                    source: e.into(),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if !matcher.matches(&entry.file_name().to_string_lossy()) {
                continue;
            }

            // During generation an unreadable module is a scan failure:
            // it aborts the build instead of being skipped.
            let module = ModuleFile::open(entry.path()).map_err(|e| match e {
                Error::Metadata { path, source } => Error::Scan { path, source },
                other => other,
            })?;
            let mut patterns = Vec::new();
            for alias in module.aliases() {
                match Pattern::new(&alias) {
                    Ok(pattern) => patterns.push(pattern),
                    // A malformed pattern costs the module that one alias,
                    // not the whole cache.
                    Err(e) => warn!(
                        "{}: dropping malformed alias pattern '{}': {}",
                        module.name(),
                        alias,
                        e
                    ),
                }
            }
            let blacklisted = blacklist.iter().any(|b| names_equal(b, module.name()));
            records.push(ModuleRecord {
                name: module.name().to_string(),
                path: entry.path().to_path_buf(),
                patterns,
                blacklisted,
            });
        }
        Ok(Self { records })
    }

    /// First record whose name matches under hyphen/underscore-insensitive
    /// comparison.
    pub fn find_by_name(&self, name: &str) -> Option<&ModuleRecord> {
        self.records.iter().find(|r| names_equal(name, &r.name))
    }

    /// First record with an alias pattern matching `alias`, in registration
    /// order. On a total miss, an alias qualified with a subsystem prefix
    /// ("fs-ext4:ext4") is retried as a plain name lookup of the suffix.
    pub fn find_by_alias(&self, alias: &str) -> Option<&ModuleRecord> {
        for record in &self.records {
            if record.patterns.iter().any(|p| p.matches(alias)) {
                return Some(record);
            }
        }
        let (_, name) = alias.split_once(':')?;
        if name.is_empty() {
            return None;
        }
        self.find_by_name(name)
    }

    /// Resolve an identifier the way clients hand them in: as a name first,
    /// as an alias second.
    pub fn resolve(&self, identifier: &str) -> Option<&ModuleRecord> {
        self.find_by_name(identifier)
            .or_else(|| self.find_by_alias(identifier))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Module name comparison treating `-` and `_` as the same character.
/// Names of different lengths never match.
pub fn names_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(&x, &y)| x == y || (matches!(x, b'-' | b'_') && matches!(y, b'-' | b'_')))
}

/// Release string of the running kernel, via uname(2).
pub fn kernel_release() -> io::Result<String> {
    // SAFETY: uname only writes into the buffer we hand it; the release
    // field is NUL-terminated by the kernel.
    let mut info: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut info) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let release = unsafe { CStr::from_ptr(info.release.as_ptr()) };
    Ok(release.to_string_lossy().into_owned())
}

/// Module tree of the running kernel: `/lib/modules/<release>`.
pub fn default_module_root() -> io::Result<PathBuf> {
    Ok(Path::new(MODULE_DIRECTORY).join(kernel_release()?))
}

/// Read the blacklist file: one module name per line, `#` comments and
/// blank lines ignored. A missing file is an empty blacklist.
pub fn load_blacklist(path: &Path) -> io::Result<HashSet<String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e),
    };
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
