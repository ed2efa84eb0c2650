use crate::config::types::{Result, SandboxError};
use crate::core::types::{
    CompletionCallback, CoordinatorRequest, RaceReport, WorkerCommand, READY_TOKEN,
};
use crate::kernel::signal::{self, SignalCallback, TERMINATION_SIGNALS};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Priority of the per-run forwarding callback; runs before host shutdown logic
const FORWARD_PRIORITY: i32 = 0;

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Process(format!("{prefix}: {err}"))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
struct GroupConfig {
    timeout: Duration,
    worker: WorkerCommand,
    on_done: Option<CompletionCallback>,
}

#[derive(Default)]
struct RunState {
    /// Coordinator pid; cleared the moment it is reaped
    coordinator: Option<Pid>,
    killed: bool,
    finished: bool,
    report: Option<RaceReport>,
}

/// One execution attempt, shared between the owner and its watcher thread
#[derive(Default)]
struct Run {
    state: Mutex<RunState>,
    done: Condvar,
}

impl Run {
    fn is_finished(&self) -> bool {
        lock(&self.state).finished
    }

    fn wait_finished(&self) -> Option<RaceReport> {
        let mut state = lock(&self.state);
        while !state.finished {
            state = self
                .done
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.report.clone()
    }
}

/// Runs a worker command as an isolated process group with a hard wall-clock
/// timeout. See [`crate::core::coordinator`] for the process layout.
///
/// All methods take `&self`; a group can be shared between the thread that
/// starts runs and one that kills them.
///
/// The completion callback runs on a watcher thread and must not call
/// [`wait`](Self::wait) or [`kill`](Self::kill) on its own group.
pub struct SupervisedGroup {
    helper: PathBuf,
    config: Mutex<GroupConfig>,
    current: Mutex<Option<Arc<Run>>>,
}

impl SupervisedGroup {
    /// Uses the running executable as the helper binary
    pub fn new(timeout: Duration, worker: WorkerCommand) -> Result<Self> {
        Ok(Self::with_helper(std::env::current_exe()?, timeout, worker))
    }

    /// `helper` must be a guestvisor binary; it is re-executed for the
    /// coordinator and sentinel roles.
    pub fn with_helper(helper: impl Into<PathBuf>, timeout: Duration, worker: WorkerCommand) -> Self {
        Self {
            helper: helper.into(),
            config: Mutex::new(GroupConfig {
                timeout,
                worker,
                on_done: None,
            }),
            current: Mutex::new(None),
        }
    }

    pub fn helper(&self) -> &Path {
        &self.helper
    }

    /// Register the single callback invoked with each resolved run's report
    pub fn when_done<F>(&self, callback: F)
    where
        F: Fn(&RaceReport) + Send + Sync + 'static,
    {
        lock(&self.config).on_done = Some(Arc::new(callback));
    }

    /// Replace the worker for subsequent runs
    pub fn set_worker(&self, worker: WorkerCommand) {
        lock(&self.config).worker = worker;
    }

    pub fn set_timeout(&self, timeout: Duration) {
        lock(&self.config).timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        lock(&self.config).timeout
    }

    fn current_run(&self) -> Option<Arc<Run>> {
        lock(&self.current).clone()
    }

    /// Spawn the coordinator and block until it reports readiness.
    pub fn start(&self) -> Result<()> {
        let mut current = lock(&self.current);
        if let Some(run) = current.as_ref() {
            if !run.is_finished() {
                return Err(SandboxError::AlreadyRunning);
            }
        }

        let config = lock(&self.config).clone();
        let run = Arc::new(Run::default());
        let started = Instant::now();

        let forwarder = {
            let run = run.clone();
            signal::callback(move |sig| {
                let state = lock(&run.state);
                if let Some(pid) = state.coordinator {
                    debug!("Forwarding {} to coordinator {} as SIGTERM", sig, pid);
                    let _ = kill(pid, Signal::SIGTERM);
                }
            })
        };
        signal::register_signals(&TERMINATION_SIGNALS, &forwarder, FORWARD_PRIORITY)?;

        let (child, stdout) = match self.spawn_coordinator(&config, &run) {
            Ok(spawned) => spawned,
            Err(e) => {
                let _ = signal::unregister_signals(&TERMINATION_SIGNALS, &forwarder);
                return Err(e);
            }
        };
        let pid = Pid::from_raw(child.id() as i32);
        debug!("Coordinator {} ready", pid);

        let watcher = {
            let run = run.clone();
            let on_done = config.on_done.clone();
            let forwarder = forwarder.clone();
            std::thread::Builder::new()
                .name(format!("supervise-{}", pid))
                .spawn(move || watch(run, pid, stdout, on_done, forwarder, started))
        };
        if let Err(e) = watcher {
            // Nobody would ever reap the coordinator; tear the run down here.
            let _ = kill(pid, Signal::SIGTERM);
            let _ = waitpid(pid, None);
            let _ = signal::unregister_signals(&TERMINATION_SIGNALS, &forwarder);
            return Err(to_process_error("spawn(watcher)", e));
        }

        // The std handle is not used for reaping; the watcher owns that.
        drop(child);
        *current = Some(run);
        Ok(())
    }

    fn spawn_coordinator(&self, config: &GroupConfig, run: &Arc<Run>) -> Result<(Child, BufReader<ChildStdout>)> {
        let request = CoordinatorRequest {
            timeout_ms: config.timeout.as_millis() as u64,
            worker: config.worker.clone(),
        };

        let mut child = Command::new(&self.helper)
            .args(["--internal-role", "coordinator"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| {
                SandboxError::StartupFailure(format!(
                    "spawn({}) failed: {}",
                    self.helper.display(),
                    e
                ))
            })?;
        let pid = Pid::from_raw(child.id() as i32);
        lock(&run.state).coordinator = Some(pid);

        let handshake = (|| -> std::result::Result<BufReader<ChildStdout>, String> {
            let mut stdin = child.stdin.take().ok_or("coordinator stdin missing")?;
            let payload = serde_json::to_vec(&request).map_err(|e| e.to_string())?;
            stdin
                .write_all(&payload)
                .and_then(|_| stdin.flush())
                .map_err(|e| format!("failed to send request: {}", e))?;
            drop(stdin);

            let stdout = child.stdout.take().ok_or("coordinator stdout missing")?;
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            reader
                .read_line(&mut line)
                .map_err(|e| format!("failed to read readiness token: {}", e))?;
            if line.trim_end() != READY_TOKEN {
                return Err(format!("unexpected handshake {:?}", line.trim_end()));
            }
            Ok(reader)
        })();

        match handshake {
            Ok(reader) => Ok((child, reader)),
            Err(reason) => {
                let _ = kill(pid, Signal::SIGKILL);
                let _ = child.wait();
                lock(&run.state).coordinator = None;
                Err(SandboxError::StartupFailure(reason))
            }
        }
    }

    /// Whether a run is still in flight. Non-blocking.
    pub fn running(&self) -> bool {
        self.current_run()
            .map(|run| !run.is_finished())
            .unwrap_or(false)
    }

    /// Pid of the current coordinator, while it is alive
    pub fn coordinator_pid(&self) -> Option<i32> {
        self.current_run()
            .and_then(|run| lock(&run.state).coordinator.map(Pid::as_raw))
    }

    /// Block until the coordinator has exited and the completion callback (if
    /// any) has returned. Returns the run's report; `None` when there was no
    /// run or the run was killed. A coordinator that died without reporting
    /// yields an [`Outcome::Lost`](crate::core::types::Outcome::Lost) report.
    pub fn wait(&self) -> Option<RaceReport> {
        self.current_run()?.wait_finished()
    }

    /// Tear down the current run and wait for it. No-op without a run.
    pub fn kill(&self) -> Result<()> {
        let Some(run) = self.current_run() else {
            return Ok(());
        };
        {
            let mut state = lock(&run.state);
            if state.finished {
                return Ok(());
            }
            state.killed = true;
            if let Some(pid) = state.coordinator {
                info!("Killing coordinator {} and its worker group", pid);
                match kill(pid, Signal::SIGTERM) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => return Err(to_process_error("kill(coordinator)", e)),
                }
            }
        }
        run.wait_finished();
        Ok(())
    }
}

/// Per-run watcher: read the report, reap the coordinator, run the callback.
fn watch(
    run: Arc<Run>,
    pid: Pid,
    mut status_pipe: BufReader<ChildStdout>,
    on_done: Option<CompletionCallback>,
    forwarder: SignalCallback,
    started: Instant,
) {
    let mut line = String::new();
    let report = match status_pipe.read_line(&mut line) {
        Ok(0) => None,
        Ok(_) => match serde_json::from_str::<RaceReport>(line.trim_end()) {
            Ok(report) => Some(report),
            Err(e) => {
                debug!("Coordinator {} sent no usable report ({}): {:?}", pid, e, line);
                None
            }
        },
        Err(e) => {
            debug!("Reading coordinator {} status pipe failed: {}", pid, e);
            None
        }
    };
    drop(status_pipe);

    // Wait without reaping so the pid cannot be recycled while kill() may
    // still target it; the real reap happens under the state lock.
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("waitid(coordinator {}) failed: {}", pid, e);
                break;
            }
        }
    }
    let killed = {
        let mut state = lock(&run.state);
        match waitpid(pid, None) {
            Ok(status) => debug!("Coordinator {} stopped: {:?}", pid, status),
            Err(e) => warn!("waitpid(coordinator {}) failed: {}", pid, e),
        }
        state.coordinator = None;
        state.killed
    };

    if let Err(e) = signal::unregister_signals(&TERMINATION_SIGNALS, &forwarder) {
        warn!("Failed to remove forwarding callback: {}", e);
    }

    let report = match report {
        Some(report) => Some(report),
        None if killed => None,
        None => {
            warn!("Coordinator {} exited without a report; run is lost", pid);
            Some(RaceReport::lost(started.elapsed().as_millis() as u64))
        }
    };

    if !killed {
        if let (Some(report), Some(callback)) = (report.as_ref(), on_done) {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(report)));
            if outcome.is_err() {
                warn!("Completion callback for coordinator {} panicked", pid);
            }
        }
    }

    let mut state = lock(&run.state);
    state.report = if killed { None } else { report };
    state.finished = true;
    run.done.notify_all();
}
