//! The short-lived client side of the daemon protocol.
//!
//! Wire format: the request is the raw bytes of a module name or alias, no
//! framing; the response is the raw bytes of the resolved absolute path, or
//! a bare connection close for not-found. No error codes travel the wire.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use crate::config::MAX_REQUEST_LEN;
use crate::error::{Error, Result};

/// Ask the daemon at `socket_path` to resolve `identifier`.
///
/// `Ok(None)` is the daemon's not-found signal; IPC failures are errors.
pub fn request(socket_path: &Path, identifier: &str) -> Result<Option<PathBuf>> {
    if identifier.is_empty() || identifier.len() > MAX_REQUEST_LEN {
        return Err(Error::Ipc(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("identifier must be 1..={MAX_REQUEST_LEN} bytes"),
        )));
    }

    let mut stream = UnixStream::connect(socket_path).map_err(Error::Ipc)?;
    stream
        .write_all(identifier.as_bytes())
        .map_err(Error::Ipc)?;
    // Half-close so the server sees the end of the request.
    stream.shutdown(Shutdown::Write).map_err(Error::Ipc)?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).map_err(Error::Ipc)?;
    if response.is_empty() {
        return Ok(None);
    }
    Ok(Some(PathBuf::from(OsString::from_vec(response))))
}
