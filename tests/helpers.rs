//! Shared test utilities: synthetic module trees and a fake kernel.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use kmodd::cache::names_equal;
use kmodd::loader::{Kernel, LoadStatus};
use kmodd::module::scan_fields;

/// A temporary module tree to generate caches from.
pub struct ModuleTree {
    /// Kept alive for the lifetime of the tree.
    pub _temp_dir: TempDir,
    pub root: PathBuf,
}

impl ModuleTree {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let root = temp_dir.path().join("modules");
        fs::create_dir_all(&root).expect("failed to create module root");
        Self {
            _temp_dir: temp_dir,
            root,
        }
    }
}

/// Write a synthetic `.ko` file: binary junk around a NUL-separated
/// `key=value` string table, the way the real build toolchain embeds it.
pub fn write_module(root: &Path, relative: &str, aliases: &[&str], depends: &str) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("failed to create module dir");
    }

    let file_name = path.file_name().expect("module file name").to_string_lossy();
    let stem = file_name.split('.').next().expect("module stem");
    let name = stem.replace('-', "_");

    let mut bytes: Vec<u8> = vec![0x7f, b'E', b'L', b'F', 0x02, 0x01, 0xfe, 0x00];
    bytes.extend_from_slice(format!("name={name}").as_bytes());
    bytes.push(0);
    for alias in aliases {
        bytes.extend_from_slice(format!("alias={alias}").as_bytes());
        bytes.push(0);
    }
    bytes.extend_from_slice(format!("depends={depends}").as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

    fs::write(&path, bytes).expect("failed to write module file");
    path
}

/// In-memory stand-in for init_module(2) and /proc/modules.
///
/// Identifies images by the `name=` field the helpers embed, records loads
/// in order, and can be told to reject specific modules.
pub struct FakeKernel {
    pub loaded: RefCell<Vec<String>>,
    pub load_calls: RefCell<usize>,
    pub failing: HashSet<String>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self {
            loaded: RefCell::new(Vec::new()),
            load_calls: RefCell::new(0),
            failing: HashSet::new(),
        }
    }

    pub fn with_loaded(names: &[&str]) -> Self {
        let kernel = Self::new();
        kernel
            .loaded
            .borrow_mut()
            .extend(names.iter().map(|n| n.to_string()));
        kernel
    }

    pub fn failing(name: &str) -> Self {
        let mut kernel = Self::new();
        kernel.failing.insert(name.to_string());
        kernel
    }

    pub fn loaded_order(&self) -> Vec<String> {
        self.loaded.borrow().clone()
    }

    pub fn load_calls(&self) -> usize {
        *self.load_calls.borrow()
    }

    fn name_of(image: &[u8]) -> String {
        scan_fields(image, "name").into_iter().next().unwrap_or_default()
    }
}

impl Kernel for &FakeKernel {
    fn load_module(&self, image: &[u8], _params: &str) -> io::Result<LoadStatus> {
        *self.load_calls.borrow_mut() += 1;
        let name = FakeKernel::name_of(image);
        if self.failing.contains(&name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("fake kernel rejected {name}"),
            ));
        }
        let mut loaded = self.loaded.borrow_mut();
        if loaded.iter().any(|l| names_equal(l, &name)) {
            return Ok(LoadStatus::AlreadyLoaded);
        }
        loaded.push(name);
        Ok(LoadStatus::Loaded)
    }

    fn is_loaded(&self, name: &str) -> bool {
        self.loaded.borrow().iter().any(|l| names_equal(l, name))
    }
}
