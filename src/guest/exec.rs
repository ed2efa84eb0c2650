//! Worker side of a guest launch (`--internal-role guest-exec`).
//!
//! Runs inside the worker process group right before the guest kernel
//! replaces it. Any failure exits with [`GUEST_SETUP_FAILED`] so the caller
//! can tell setup problems from guest-reported exit codes.
use crate::config::types::{Result, SandboxError, GUEST_SETUP_FAILED};
use crate::core::coordinator::set_parent_death_signal;
use crate::guest::launch::GuestPlan;
use crate::kernel::flock;
use crate::utils::fd_closure::cloexec_all_except;
use log::{debug, error, warn};
use nix::sys::signal::Signal;
use nix::unistd::execv;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};

fn redirect(from: RawFd, to: RawFd, what: &str) -> Result<()> {
    // SAFETY: dup2 on descriptors we hold open.
    if unsafe { libc::dup2(from, to) } < 0 {
        return Err(SandboxError::Process(format!(
            "dup2({}) failed: {}",
            what,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn preallocate(plan: &GuestPlan) -> Result<()> {
    for file in &plan.preallocate {
        let handle = File::create(&file.path).map_err(|e| {
            SandboxError::Process(format!("create {}: {}", file.path.display(), e))
        })?;
        handle.set_len(file.size)?;
        debug!("Preallocated {} ({} bytes)", file.path.display(), file.size);
    }
    Ok(())
}

fn redirect_stdio(plan: &GuestPlan) -> Result<()> {
    let devnull = File::open("/dev/null")?;
    redirect(devnull.as_raw_fd(), libc::STDIN_FILENO, "stdin")?;

    let console = match &plan.console {
        Some(path) => OpenOptions::new().create(true).append(true).open(path),
        None => OpenOptions::new().write(true).open("/dev/null"),
    }?;
    redirect(console.as_raw_fd(), libc::STDOUT_FILENO, "stdout")?;
    redirect(libc::STDOUT_FILENO, libc::STDERR_FILENO, "stderr")?;
    Ok(())
}

/// Take every requested lock and leak its descriptor into the guest
fn take_locks(plan: &GuestPlan) -> Result<Vec<RawFd>> {
    let mut keep = Vec::with_capacity(plan.locks.len());
    for request in &plan.locks {
        let file = flock::lock_path(&request.path, request.mode)?;
        let fd = flock::inherit_across_exec(file)?;
        debug!(
            "Holding {:?} lock on {} as fd {}",
            request.mode,
            request.path.display(),
            fd
        );
        keep.push(fd);
    }
    Ok(keep)
}

fn apply_nice(level: i32) {
    if level == 0 {
        return;
    }
    // SAFETY: setpriority on our own process.
    if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, level) } != 0 {
        warn!(
            "Failed to set nice level to {}: {}",
            level,
            std::io::Error::last_os_error()
        );
    }
}

fn exec_kernel(argv: &[String]) -> Result<()> {
    if argv.is_empty() {
        return Err(SandboxError::Config("empty argv for guest exec".to_string()));
    }
    let mut cargv = Vec::with_capacity(argv.len());
    for arg in argv {
        let c = CString::new(arg.as_str())
            .map_err(|_| SandboxError::Config("guest argument contains NUL byte".to_string()))?;
        cargv.push(c);
    }
    execv(cargv[0].as_c_str(), &cargv)
        .map_err(|e| SandboxError::Process(format!("execv({}): {}", argv[0], e)))?;
    Ok(())
}

/// Performs the setup sequence and execs; only returns on failure
pub fn exec_guest(plan: &GuestPlan) -> Result<()> {
    preallocate(plan)?;
    redirect_stdio(plan)?;
    let keep = take_locks(plan)?;
    cloexec_all_except(&keep)?;
    apply_nice(plan.nice_level);
    debug!("PID {} executing: {}", std::process::id(), plan.argv.join(" "));
    exec_kernel(&plan.argv)
}

/// Entry point for `--internal-role guest-exec --plan <json>`
pub fn run_guest_exec_role(plan_json: &str) -> ! {
    // Survives execv; the guest dies with its coordinator.
    set_parent_death_signal(Signal::SIGKILL);
    let result = serde_json::from_str::<GuestPlan>(plan_json)
        .map_err(SandboxError::from)
        .and_then(|plan| exec_guest(&plan));
    match result {
        Ok(()) => error!("Guest exec returned without replacing the process"),
        Err(e) => error!("Guest execution failed: {}", e),
    }
    std::process::exit(GUEST_SETUP_FAILED);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::launch::Preallocation;

    #[test]
    fn test_preallocate_truncates_and_extends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.tar");
        std::fs::write(&path, b"stale output").unwrap();

        let plan = GuestPlan {
            argv: vec![],
            locks: vec![],
            preallocate: vec![Preallocation {
                path: path.clone(),
                size: 4096,
            }],
            console: None,
            nice_level: 0,
        };
        preallocate(&plan).unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 4096);
        assert!(contents.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exec_rejects_empty_argv() {
        assert!(matches!(exec_kernel(&[]), Err(SandboxError::Config(_))));
    }
}
