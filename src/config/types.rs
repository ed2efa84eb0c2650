/// Shared error taxonomy and closed enums for guestvisor
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exit code used by the guest exec role when setup fails before the kernel is exec'd.
/// Distinguishable from any exit code the guest itself reports through its output disk.
pub const GUEST_SETUP_FAILED: i32 = 210;

/// Advisory lock mode requested for a disk backing file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn as_flock_op(self) -> libc::c_int {
        match self {
            Self::Shared => libc::LOCK_SH,
            Self::Exclusive => libc::LOCK_EX,
        }
    }
}

/// Terminal status reported to a slot's notifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Finished,
    Failed,
    Timeout,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    /// The coordinator never delivered its readiness token.
    #[error("Coordinator did not start properly: {0}")]
    StartupFailure(String),

    /// `start()` called while a previous run is still in flight.
    #[error("Previous run was neither waited on nor killed")]
    AlreadyRunning,

    #[error("Sandbox slot {0} is busy")]
    SlotBusy(usize),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Plugin {plugin} failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SandboxError {
    /// Errors that indicate a bug in the host rather than a runtime condition
    pub fn is_programming_misuse(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning | Self::SlotBusy(_) | Self::InvalidSignal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
