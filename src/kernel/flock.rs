//! Advisory locks on disk backing files.
//!
//! A guest holds its locks through descriptors inherited across exec, so the
//! kernel drops them when the guest exits however it exits. There is no
//! explicit unlock path.
use crate::config::types::{LockMode, Result, SandboxError};
use crate::utils::fd_closure::set_cloexec;
use std::fs::File;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;

fn open_for_lock(path: &Path) -> Result<File> {
    File::open(path)
        .map_err(|e| SandboxError::Lock(format!("Failed to open {}: {}", path.display(), e)))
}

/// Open `path` read-only and block until the lock is granted
pub fn lock_path(path: &Path, mode: LockMode) -> Result<File> {
    let file = open_for_lock(path)?;
    loop {
        // SAFETY: plain flock(2) on a descriptor we own.
        if unsafe { libc::flock(file.as_raw_fd(), mode.as_flock_op()) } == 0 {
            return Ok(file);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(SandboxError::Lock(format!(
            "flock({}, {:?}) failed: {}",
            path.display(),
            mode,
            err
        )));
    }
}

/// Non-blocking variant: `Ok(None)` when a conflicting lock is held elsewhere
pub fn try_lock_path(path: &Path, mode: LockMode) -> Result<Option<File>> {
    let file = open_for_lock(path)?;
    // SAFETY: plain flock(2) on a descriptor we own.
    if unsafe { libc::flock(file.as_raw_fd(), mode.as_flock_op() | libc::LOCK_NB) } == 0 {
        return Ok(Some(file));
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(None);
    }
    Err(SandboxError::Lock(format!(
        "flock({}, {:?}) failed: {}",
        path.display(),
        mode,
        err
    )))
}

/// Whether some process currently holds a lock on `path` that conflicts with
/// an exclusive request. This is how outside tooling asks "is this image in
/// use by a guest right now".
pub fn is_in_use(path: &Path) -> Result<bool> {
    Ok(try_lock_path(path, LockMode::Exclusive)?.is_none())
}

/// Clear close-on-exec and give up ownership so the descriptor (and its lock)
/// survives the coming exec. Returns the leaked descriptor number.
pub fn inherit_across_exec(file: File) -> Result<RawFd> {
    set_cloexec(file.as_raw_fd(), false).map_err(|e| {
        SandboxError::Lock(format!("Failed to clear FD_CLOEXEC on lock fd: {}", e))
    })?;
    Ok(file.into_raw_fd())
}
