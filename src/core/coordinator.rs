//! Coordinator and sentinel process roles.
//!
//! The coordinator is the helper binary re-executed with
//! `--internal-role coordinator`. It owns the race between the worker and the
//! sentinel and is the only process that reaps them:
//!
//! ```text
//! owner ──stdin: CoordinatorRequest──▶ coordinator (own session, subreaper)
//!       ◀─stdout: READY_TOKEN\n ──────┤   ├─ worker   (own process group)
//!       ◀─stdout: RaceReport\n ───────┘   └─ sentinel (sleeps timeout_ms)
//! ```
use crate::config::types::{Result, SandboxError};
use crate::core::types::{CoordinatorRequest, Outcome, RaceReport, READY_TOKEN};
use crate::kernel::signal;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getppid, setsid, Pid};
use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Set once the coordinator starts tearing down because of a termination
/// request; the race loop stops producing a report from then on.
static TERMINATING: AtomicBool = AtomicBool::new(false);

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Process(format!("{prefix}: {err}"))
}

fn write_status_line(line: &str) -> Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(line.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

/// Ask the kernel to send `sig` when our parent goes away
pub(crate) fn set_parent_death_signal(sig: Signal) {
    // SAFETY: prctl with integer arguments only.
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, sig as libc::c_ulong) } != 0 {
        warn!(
            "PR_SET_PDEATHSIG failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

fn become_subreaper() -> Result<()> {
    // SAFETY: prctl with integer arguments only.
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1) } != 0 {
        return Err(to_process_error(
            "prctl(PR_SET_CHILD_SUBREAPER)",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// SIGKILL every member of `pgid` and reap all of them that are our children.
/// Returns the number of processes reaped.
fn kill_and_reap_group(pgid: Pid) -> u32 {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("killpg({}) failed: {}", pgid, e),
    }

    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-pgid.as_raw()), None) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => reaped += 1,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                warn!("waitpid(group {}) failed: {}", pgid, e);
                break;
            }
        }
    }
    reaped
}

/// Reap whatever else has already exited (escaped descendants adopted by us)
fn drain_zombies() -> u32 {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => reaped += 1,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    reaped
}

fn reap_pid(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => return,
        }
    }
}

/// Block until either participant finishes. Other adopted descendants that
/// exit in the meantime are reaped and counted.
fn race(worker: Pid, sentinel: Pid) -> Result<(Pid, Outcome, u32)> {
    let mut reaped_descendants = 0;
    loop {
        let status = match waitpid(Pid::from_raw(-1), None) {
            Ok(status) => status,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_process_error("waitpid(race)", e)),
        };

        let (pid, outcome) = match status {
            WaitStatus::Exited(pid, code) => (pid, Outcome::from_exit_code(code)),
            WaitStatus::Signaled(pid, sig, _) => (
                pid,
                Outcome::Signaled {
                    signal: sig as i32,
                },
            ),
            _ => continue,
        };

        if pid == worker {
            return Ok((worker, outcome, reaped_descendants));
        }
        if pid == sentinel {
            return Ok((sentinel, Outcome::TimedOut, reaped_descendants));
        }
        debug!("Reaped adopted descendant {}", pid);
        reaped_descendants += 1;
    }
}

fn termination_mask() -> SigSet {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGTERM);
    mask
}

fn coordinate(req: CoordinatorRequest) -> Result<RaceReport> {
    let start = Instant::now();

    // SIGTERM stays pending until the teardown callback knows both pids.
    // Spawned children start with an empty mask (std resets it before exec).
    termination_mask()
        .thread_block()
        .map_err(|e| to_process_error("pthread_sigmask(block SIGTERM)", e))?;

    if let Err(e) = setsid() {
        warn!("setsid() failed, staying in caller's session: {}", e);
    }
    become_subreaper()?;

    let worker_out = std::io::stderr().as_fd().try_clone_to_owned()?;
    let mut worker_cmd = Command::new(&req.worker.program);
    worker_cmd
        .args(&req.worker.args)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::from(worker_out));
    if let Some(dir) = &req.worker.current_dir {
        worker_cmd.current_dir(dir);
    }
    let worker = worker_cmd.spawn().map_err(|e| {
        to_process_error(&format!("spawn({})", req.worker.program.display()), e)
    })?;
    let worker_pid = Pid::from_raw(worker.id() as i32);
    // The worker leads its own group, so its pid is the group id.
    let worker_pgid = worker_pid;

    let sentinel = std::env::current_exe()
        .and_then(|exe| {
            Command::new(exe)
                .args([
                    "--internal-role",
                    "sentinel",
                    "--timeout-ms",
                    &req.timeout_ms.to_string(),
                    "--worker-pgid",
                    &worker_pgid.to_string(),
                ])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .spawn()
        })
        .map_err(|e| {
            kill_and_reap_group(worker_pgid);
            to_process_error("spawn(sentinel)", e)
        })?;
    let sentinel_pid = Pid::from_raw(sentinel.id() as i32);

    debug!(
        "Coordinator {}: worker {} sentinel {} timeout {}ms",
        std::process::id(),
        worker_pid,
        sentinel_pid,
        req.timeout_ms
    );

    let on_terminate = signal::callback(move |sig| {
        TERMINATING.store(true, Ordering::SeqCst);
        info!(
            "Coordinator received {}; killing sentinel {} and worker group {}",
            sig, sentinel_pid, worker_pgid
        );
        let _ = kill(sentinel_pid, Signal::SIGKILL);
        kill_and_reap_group(worker_pgid);
        reap_pid(sentinel_pid);
        std::process::exit(1);
    });
    if let Err(e) = signal::register_signals(&[Signal::SIGTERM], &on_terminate, 0) {
        let _ = kill(sentinel_pid, Signal::SIGKILL);
        kill_and_reap_group(worker_pgid);
        reap_pid(sentinel_pid);
        return Err(e);
    }
    termination_mask()
        .thread_unblock()
        .map_err(|e| to_process_error("pthread_sigmask(unblock SIGTERM)", e))?;

    write_status_line(READY_TOKEN)?;

    let (winner, outcome, mut reaped_descendants) = race(worker_pid, sentinel_pid)?;
    if TERMINATING.load(Ordering::SeqCst) {
        // The termination callback owns the rest of the teardown and exits.
        loop {
            std::thread::park();
        }
    }

    if winner == worker_pid {
        let _ = kill(sentinel_pid, Signal::SIGKILL);
        reap_pid(sentinel_pid);
    } else {
        info!("Worker {} timed out after {}ms", worker_pid, req.timeout_ms);
    }
    reaped_descendants += kill_and_reap_group(worker_pgid);
    reaped_descendants += drain_zombies();

    signal::unregister_signals(&[Signal::SIGTERM], &on_terminate)?;

    Ok(RaceReport {
        outcome,
        worker_pid: worker_pid.as_raw(),
        sentinel_pid: sentinel_pid.as_raw(),
        reaped_descendants,
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}

/// Entry point for `--internal-role coordinator`
pub fn run_coordinator_role() -> ! {
    let request: Result<CoordinatorRequest> =
        serde_json::from_reader(std::io::stdin().lock()).map_err(SandboxError::from);

    let code = match request.and_then(coordinate) {
        Ok(report) => match serde_json::to_string(&report)
            .map_err(SandboxError::from)
            .and_then(|line| write_status_line(&line))
        {
            Ok(()) => 0,
            Err(e) => {
                error!("Coordinator failed to deliver its report: {}", e);
                1
            }
        },
        Err(e) => {
            error!("Coordinator failed: {}", e);
            // Only reaches the owner as a startup failure if the token was not
            // sent yet; afterwards the owner just sees no report.
            let _ = write_status_line(&format!("startup failed: {}", e));
            1
        }
    };
    std::process::exit(code);
}

fn kill_orphaned_group(pgid: Pid) -> ! {
    warn!("Coordinator is gone; killing worker group {}", pgid);
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("killpg({}) failed: {}", pgid, e),
    }
    std::process::exit(1);
}

/// Entry point for `--internal-role sentinel`: sleep for the timeout and exit.
///
/// With `worker_pgid`, the sentinel also outlives a coordinator that dies
/// without tearing down: parent death delivers SIGTERM, and the sentinel
/// kills the worker group the coordinator left behind.
pub fn run_sentinel_role(timeout_ms: u64, worker_pgid: Option<i32>) -> ! {
    let parent = getppid();
    match worker_pgid.map(Pid::from_raw) {
        Some(pgid) => {
            let on_orphaned = signal::callback(move |_| kill_orphaned_group(pgid));
            if let Err(e) = signal::register_signals(&[Signal::SIGTERM], &on_orphaned, 0) {
                warn!("Sentinel cannot watch its coordinator: {}", e);
            }
            set_parent_death_signal(Signal::SIGTERM);
            if getppid() != parent {
                kill_orphaned_group(pgid);
            }
        }
        None => set_parent_death_signal(Signal::SIGKILL),
    }
    std::thread::sleep(Duration::from_millis(timeout_ms));
    std::process::exit(0);
}
