//! In-memory files for configuration images.
//!
//! A host that generates its configuration can hand the engine a path
//! without touching disk: the bytes go into an anonymous memory file and
//! the engine reads `/proc/<pid>/fd/<n>`.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// An anonymous in-memory file and a path that opens it.
#[derive(Debug)]
pub struct MemfdImage {
    file: File,
    path: PathBuf,
}

impl MemfdImage {
    /// Path usable as `-c <path>` while this image is alive.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

/// Copy `image` into a new memory file named `name`.
#[cfg(target_os = "linux")]
pub fn create_memfd_for_so(image: &[u8], name: &str) -> io::Result<MemfdImage> {
    use std::ffi::CString;
    use std::io::Write;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    let name = CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains a NUL byte"))?;

    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by memfd_create and is owned by nothing else.
    let mut file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
    file.write_all(image)?;

    let path = PathBuf::from(format!("/proc/{}/fd/{}", std::process::id(), file.as_raw_fd()));
    tracing::debug!(path = %path.display(), bytes = image.len(), "Memory file created");
    Ok(MemfdImage { file, path })
}

/// Memory files are Linux-only.
#[cfg(not(target_os = "linux"))]
pub fn create_memfd_for_so(_image: &[u8], _name: &str) -> io::Result<MemfdImage> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "memfd_create is not available on this platform"))
}
