/// Descriptor hygiene before the final exec into a guest kernel.
///
/// Everything above stderr is marked close-on-exec except an explicit keep
/// list (the inherited lock descriptors). Marking instead of closing leaves
/// the descriptors usable until the exec itself, which matters for the
/// directory handle used while walking /proc/self/fd.
use crate::config::types::{Result, SandboxError};
use std::fs;
use std::os::unix::io::RawFd;

/// Mark every open descriptor > 2 close-on-exec, except those in `keep`
pub fn cloexec_all_except(keep: &[RawFd]) -> Result<()> {
    let fds = get_open_fds()?;
    let mut marked = 0;

    for fd in fds {
        if fd <= 2 || keep.contains(&fd) {
            continue;
        }
        match set_cloexec(fd, true) {
            Ok(()) => marked += 1,
            // The /proc/self/fd directory handle is gone once read_dir finished.
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => {}
            Err(e) => {
                return Err(SandboxError::Process(format!(
                    "Failed to set FD_CLOEXEC on fd {}: {}",
                    fd, e
                )))
            }
        }
    }

    log::debug!("Marked {} inherited FDs close-on-exec (kept {:?})", marked, keep);
    Ok(())
}

/// Set or clear FD_CLOEXEC on a single descriptor
pub fn set_cloexec(fd: RawFd, enabled: bool) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Whether FD_CLOEXEC is set on `fd`
pub fn is_cloexec(fd: RawFd) -> std::io::Result<bool> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(flags & libc::FD_CLOEXEC != 0)
}

/// Get list of open file descriptors
pub fn get_open_fds() -> Result<Vec<RawFd>> {
    let fd_dir = "/proc/self/fd";

    let entries = fs::read_dir(fd_dir)
        .map_err(|e| SandboxError::Process(format!("Failed to read {}: {}", fd_dir, e)))?;

    let mut fds = Vec::new();

    for entry in entries.flatten() {
        if let Ok(file_name) = entry.file_name().into_string() {
            if let Ok(fd) = file_name.parse::<RawFd>() {
                fds.push(fd);
            }
        }
    }

    fds.sort();
    Ok(fds)
}
