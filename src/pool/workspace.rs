/// Per-slot working directory: `work_dir/<index>/` with the console log and
/// the output disk image. Wiped and recreated at the start of every run.
use crate::config::types::{Result, SandboxError};
use std::ffi::{CStr, CString};
use std::fs;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

pub const VM_LOG: &str = "vm.log";
pub const OUTPUT_IMAGE: &str = "output.tar";

#[derive(Clone, Debug)]
pub struct SlotWorkspace {
    root: PathBuf,
}

impl SlotWorkspace {
    pub fn new(work_dir: &Path, index: usize) -> Self {
        Self {
            root: work_dir.join(index.to_string()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vm_log(&self) -> PathBuf {
        self.root.join(VM_LOG)
    }

    pub fn output_image(&self) -> PathBuf {
        self.root.join(OUTPUT_IMAGE)
    }

    /// Delete everything from the previous run and recreate the directory
    pub fn reset(&self) -> Result<()> {
        remove_tree_nofollow(&self.root)?;
        fs::create_dir_all(&self.root).map_err(|e| {
            SandboxError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create {}: {}", self.root.display(), e),
            ))
        })
    }
}

struct DirFd(RawFd);

impl Drop for DirFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

fn last_error(what: &str) -> SandboxError {
    let err = std::io::Error::last_os_error();
    SandboxError::Io(std::io::Error::new(err.kind(), format!("{}: {}", what, err)))
}

fn open_dir_at(parent: RawFd, name: &CStr) -> Result<DirFd> {
    let fd = unsafe {
        libc::openat(
            parent,
            name.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if fd < 0 {
        return Err(last_error(&format!("openat({:?})", name)));
    }
    Ok(DirFd(fd))
}

fn lstat_at(parent: RawFd, name: &CStr) -> Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe {
        libc::fstatat(
            parent,
            name.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(last_error(&format!("fstatat({:?})", name)));
    }
    Ok(unsafe { st.assume_init() })
}

fn unlink_at(parent: RawFd, name: &CStr, flags: libc::c_int) -> Result<()> {
    if unsafe { libc::unlinkat(parent, name.as_ptr(), flags) } != 0 {
        return Err(last_error(&format!("unlinkat({:?})", name)));
    }
    Ok(())
}

/// Names in a directory, excluding `.` and `..`
fn list_dir(dir: &DirFd) -> Result<Vec<CString>> {
    let iter_fd = unsafe { libc::dup(dir.0) };
    if iter_fd < 0 {
        return Err(last_error("dup(directory)"));
    }
    let stream = unsafe { libc::fdopendir(iter_fd) };
    if stream.is_null() {
        unsafe {
            libc::close(iter_fd);
        }
        return Err(last_error("fdopendir"));
    }

    let mut names = Vec::new();
    loop {
        unsafe {
            *libc::__errno_location() = 0;
        }
        let entry = unsafe { libc::readdir(stream) };
        if entry.is_null() {
            let errno = unsafe { *libc::__errno_location() };
            unsafe {
                libc::closedir(stream);
            }
            if errno != 0 {
                return Err(SandboxError::Io(std::io::Error::from_raw_os_error(errno)));
            }
            return Ok(names);
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        let bytes = name.to_bytes();
        if bytes != b"." && bytes != b".." {
            names.push(name.to_owned());
        }
    }
}

fn remove_entry(parent: RawFd, name: &CStr, root_dev: libc::dev_t) -> Result<()> {
    let st = lstat_at(parent, name)?;
    if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
        return unlink_at(parent, name, 0);
    }
    if st.st_dev != root_dev {
        return Err(SandboxError::Process(format!(
            "Refusing to cross filesystem boundary at {:?}",
            name
        )));
    }
    let dir = open_dir_at(parent, name)?;
    for child in list_dir(&dir)? {
        remove_entry(dir.0, &child, root_dev)?;
    }
    drop(dir);
    unlink_at(parent, name, libc::AT_REMOVEDIR)
}

/// Remove `path` recursively without following symlinks or leaving its
/// filesystem. A guest that planted a symlink in its output cannot make the
/// next reset delete files outside the slot.
pub fn remove_tree_nofollow(path: &Path) -> Result<()> {
    if fs::symlink_metadata(path).is_err() {
        return Ok(());
    }
    let parent = path.parent().ok_or_else(|| {
        SandboxError::Config(format!("Cannot remove {}: no parent", path.display()))
    })?;
    let name = path.file_name().ok_or_else(|| {
        SandboxError::Config(format!("Cannot remove {}: no file name", path.display()))
    })?;
    let name = CString::new(name.as_bytes())
        .map_err(|_| SandboxError::Config(format!("NUL byte in {}", path.display())))?;
    let parent_path = CString::new(parent.as_os_str().as_bytes())
        .map_err(|_| SandboxError::Config(format!("NUL byte in {}", parent.display())))?;

    let parent_fd = unsafe {
        libc::open(
            parent_path.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if parent_fd < 0 {
        return Err(last_error(&format!("open({})", parent.display())));
    }
    let parent_fd = DirFd(parent_fd);
    let root_dev = lstat_at(parent_fd.0, &name)?.st_dev;
    remove_entry(parent_fd.0, &name, root_dev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_removes_previous_run() {
        let work = tempfile::tempdir().unwrap();
        let ws = SlotWorkspace::new(work.path(), 3);
        assert_eq!(ws.root(), work.path().join("3"));

        ws.reset().unwrap();
        fs::write(ws.vm_log(), "old console").unwrap();
        fs::create_dir_all(ws.root().join("nested/deeper")).unwrap();
        fs::write(ws.root().join("nested/deeper/file"), "x").unwrap();

        ws.reset().unwrap();
        assert!(ws.root().is_dir());
        assert_eq!(fs::read_dir(ws.root()).unwrap().count(), 0);
    }

    #[test]
    fn test_symlinks_are_removed_not_followed() {
        let work = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let precious = outside.path().join("precious.txt");
        fs::write(&precious, "keep me").unwrap();

        let ws = SlotWorkspace::new(work.path(), 0);
        ws.reset().unwrap();
        std::os::unix::fs::symlink(outside.path(), ws.root().join("escape")).unwrap();

        ws.reset().unwrap();
        assert!(!ws.root().join("escape").exists());
        assert_eq!(fs::read_to_string(&precious).unwrap(), "keep me");
    }

    #[test]
    fn test_missing_tree_is_fine() {
        let work = tempfile::tempdir().unwrap();
        remove_tree_nofollow(&work.path().join("never-created")).unwrap();
    }
}
