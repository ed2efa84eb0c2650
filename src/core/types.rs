use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// First line a coordinator writes to its status pipe once the race has begun
/// and its termination handler is installed.
pub const READY_TOKEN: &str = "ready for SIGTERM";

/// The worker routine, as an explicit program + argument list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// `/bin/sh -c <script>`, mostly for tests and ad-hoc workers
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("/bin/sh").arg("-c").arg(script)
    }
}

/// Owner->coordinator launch contract, written as JSON on the coordinator's stdin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorRequest {
    pub timeout_ms: u64,
    pub worker: WorkerCommand,
}

/// How the race between worker and sentinel resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Exited { code: i32 },
    Signaled { signal: i32 },
    TimedOut,
    /// The coordinator ended without reporting (crashed or killed from outside)
    Lost,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    /// The worker's own exit code, when it exited on its own
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Success => Some(0),
            Self::Exited { code } => Some(*code),
            Self::Signaled { .. } | Self::TimedOut | Self::Lost => None,
        }
    }

    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Success
        } else {
            Self::Exited { code }
        }
    }
}

/// Coordinator->owner result, the optional second line on the status pipe.
/// Only written after both race participants have been reaped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceReport {
    pub outcome: Outcome,
    pub worker_pid: i32,
    pub sentinel_pid: i32,
    /// Descendants of the worker adopted and reaped by the coordinator
    pub reaped_descendants: u32,
    pub elapsed_ms: u64,
}

impl RaceReport {
    /// Stand-in for a run whose coordinator never delivered a report. Pids are
    /// unknown to the owner and reported as 0.
    pub fn lost(elapsed_ms: u64) -> Self {
        Self {
            outcome: Outcome::Lost,
            worker_pid: 0,
            sentinel_pid: 0,
            reaped_descendants: 0,
            elapsed_ms,
        }
    }
}

/// Invoked once per resolved run, after the coordinator has been reaped
pub type CompletionCallback = Arc<dyn Fn(&RaceReport) + Send + Sync>;
