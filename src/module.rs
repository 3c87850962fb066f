//! Module object files and their embedded `key=value` metadata.
//!
//! A `.ko` file carries a string table of NUL-separated `key=value` pairs
//! (aliases, dependencies, license, ...) written by the build toolchain.
//! Instead of parsing the object file's section table, the extractor scans
//! the raw bytes: a hit is any occurrence of the key that sits right after
//! a NUL byte (or at the start of the file) and is immediately followed by
//! `=`. False positives from unrelated byte runs are possible and accepted.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A read-only, private memory mapping of a whole file.
///
/// The mapping is owned by the value and released exactly once on drop.
struct Mapping {
    ptr: *mut libc::c_void,
    len: usize,
}

impl Mapping {
    fn new(file: &File, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "refusing to map an empty file",
            ));
        }
        // SAFETY: the descriptor is valid for the duration of the call and
        // a failed mapping comes back as MAP_FAILED, never as a bogus
        // address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping covers exactly `len` readable bytes and lives
        // as long as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped
        // exactly once.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

// SAFETY: the mapping is read-only and file-backed; nothing in this process
// mutates it after construction.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// An opened, memory-mapped kernel module file.
pub struct ModuleFile {
    name: String,
    path: PathBuf,
    map: Mapping,
}

impl ModuleFile {
    /// Open a module file and map its contents read-only.
    ///
    /// The canonical name is derived from the file name: everything before
    /// the first `.`, with hyphens replaced by underscores.
    pub fn open(path: &Path) -> Result<Self> {
        let metadata_err = |source| Error::Metadata {
            path: path.to_path_buf(),
            source,
        };
        let name = module_name(path).ok_or_else(|| {
            metadata_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file name carries no module name",
            ))
        })?;
        let file = File::open(path).map_err(metadata_err)?;
        let len = file.metadata().map_err(metadata_err)?.len() as usize;
        let map = Mapping::new(&file, len).map_err(metadata_err)?;
        Ok(Self {
            name,
            path: path.to_path_buf(),
            map,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The raw mapped contents, as handed to the kernel load primitive.
    pub fn image(&self) -> &[u8] {
        self.map.bytes()
    }

    /// Every value of `key=` found in the embedded string table, in file
    /// order.
    pub fn fields(&self, key: &str) -> Vec<String> {
        scan_fields(self.image(), key)
    }

    /// The module's declared alias patterns.
    pub fn aliases(&self) -> Vec<String> {
        self.fields("alias")
    }

    /// The comma-separated `depends=` list. The first occurrence wins; a
    /// missing or empty field means no dependencies.
    pub fn dependencies(&self) -> Vec<String> {
        match self.fields("depends").into_iter().next() {
            Some(list) if !list.is_empty() => list.split(',').map(str::to_string).collect(),
            _ => Vec::new(),
        }
    }
}

/// Canonical module name for a file path: basename truncated at the first
/// `.`, hyphens replaced by underscores. `None` if the file name has no
/// extension to strip.
pub fn module_name(path: &Path) -> Option<String> {
    let base = path.file_name()?.to_str()?;
    let (stem, _extension) = base.split_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(stem.replace('-', "_"))
}

/// Linear byte scan for `key=value` fields in arbitrary binary content.
///
/// A match is defined purely by adjacency: the key must follow a NUL byte
/// (or start the buffer) and be followed by `=`; the value runs to the next
/// NUL or the end of the buffer. Non-UTF-8 values are lossily converted.
pub fn scan_fields(bytes: &[u8], key: &str) -> Vec<String> {
    let key = key.as_bytes();
    let mut values = Vec::new();
    let mut i = 0;
    while i + key.len() < bytes.len() {
        let at_boundary = i == 0 || bytes[i - 1] == 0;
        if at_boundary && bytes[i..].starts_with(key) && bytes[i + key.len()] == b'=' {
            let start = i + key.len() + 1;
            let end = bytes[start..]
                .iter()
                .position(|&b| b == 0)
                .map(|off| start + off)
                .unwrap_or(bytes.len());
            values.push(String::from_utf8_lossy(&bytes[start..end]).into_owned());
            i = end;
        } else {
            i += 1;
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_name_strips_extension() {
        assert_eq!(
            module_name(Path::new("/lib/modules/ext4.ko")),
            Some("ext4".into())
        );
    }

    #[test]
    fn test_module_name_truncates_at_first_dot() {
        assert_eq!(
            module_name(Path::new("virtio_blk.ko.xz")),
            Some("virtio_blk".into())
        );
    }

    #[test]
    fn test_module_name_replaces_hyphens() {
        assert_eq!(module_name(Path::new("snd-pcm.ko")), Some("snd_pcm".into()));
    }

    #[test]
    fn test_module_name_requires_extension() {
        assert_eq!(module_name(Path::new("/tmp/noext")), None);
        assert_eq!(module_name(Path::new(".hidden")), None);
    }

    #[test]
    fn test_scan_finds_field_at_buffer_start() {
        let bytes = b"alias=net-foo-*\0rest";
        assert_eq!(scan_fields(bytes, "alias"), vec!["net-foo-*"]);
    }

    #[test]
    fn test_scan_finds_fields_after_nul() {
        let bytes = b"\x7fELF garbage\0alias=pci:v1*\0alias=usb:v2*\0depends=foo,bar\0";
        assert_eq!(scan_fields(bytes, "alias"), vec!["pci:v1*", "usb:v2*"]);
        assert_eq!(scan_fields(bytes, "depends"), vec!["foo,bar"]);
    }

    #[test]
    fn test_scan_ignores_key_without_nul_boundary() {
        // "alias=" embedded mid-string is not a field.
        let bytes = b"\0xalias=nope\0alias=yes\0";
        assert_eq!(scan_fields(bytes, "alias"), vec!["yes"]);
    }

    #[test]
    fn test_scan_value_runs_to_end_of_buffer() {
        let bytes = b"\0depends=unterminated";
        assert_eq!(scan_fields(bytes, "depends"), vec!["unterminated"]);
    }

    #[test]
    fn test_scan_tolerates_binary_garbage() {
        let mut bytes = vec![0xffu8, 0x00, 0x01, 0xfe];
        bytes.extend_from_slice(b"\0license=GPL\0");
        bytes.extend_from_slice(&[0x80, 0x81, 0x00]);
        assert_eq!(scan_fields(&bytes, "license"), vec!["GPL"]);
        assert!(scan_fields(&bytes, "missing").is_empty());
    }

    #[test]
    fn test_scan_empty_value() {
        let bytes = b"\0depends=\0alias=x\0";
        assert_eq!(scan_fields(bytes, "depends"), vec![""]);
    }

    #[test]
    fn test_dependencies_split() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bar.ko");
        std::fs::write(&path, b"junk\0depends=foo,baz\0alias=x*\0").expect("write");
        let module = ModuleFile::open(&path).expect("open");
        assert_eq!(module.name(), "bar");
        assert_eq!(module.dependencies(), vec!["foo", "baz"]);
        assert_eq!(module.aliases(), vec!["x*"]);
    }

    #[test]
    fn test_open_empty_file_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.ko");
        std::fs::write(&path, b"").expect("write");
        assert!(ModuleFile::open(&path).is_err());
    }
}
