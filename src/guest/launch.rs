//! Launch specifications for one guest-kernel invocation.
//!
//! Building the guest's argument list is pure data transformation; the
//! side-effecting half (locks, redirection, exec) runs in the worker as the
//! `guest-exec` role, see [`crate::guest::exec`].
use crate::config::types::{LockMode, Result, SandboxError};
use crate::core::supervisor::SupervisedGroup;
use crate::core::types::{RaceReport, WorkerCommand};
use crate::guest::network::TapDevice;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Flags of a valid `ubd<letter><flags>` device name, `None` if the name does
/// not follow the pattern.
pub fn device_flags(device: &str) -> Option<&str> {
    let rest = device.strip_prefix("ubd")?;
    let mut chars = rest.chars();
    let letter = chars.next()?;
    if !letter.is_ascii_lowercase() {
        return None;
    }
    let flags = chars.as_str();
    if flags.chars().all(|c| matches!(c, 'r' | 'c' | 's' | 'd')) {
        Some(flags)
    } else {
        None
    }
}

/// Lock intent implied by a device name: read-only (`r`) or copy-on-write
/// (`c`) devices share, everything else is exclusive.
pub fn inferred_lock_mode(device: &str) -> Option<LockMode> {
    let flags = device_flags(device)?;
    if flags.contains('r') || flags.contains('c') {
        Some(LockMode::Shared)
    } else {
        Some(LockMode::Exclusive)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub path: PathBuf,
    /// `None` means the backing file is not locked at all
    pub lock: Option<LockMode>,
}

impl DiskSpec {
    pub fn new(path: impl Into<PathBuf>, lock: Option<LockMode>) -> Self {
        Self {
            path: path.into(),
            lock,
        }
    }

    /// Lock intent taken from the device name
    pub fn inferred(device: &str, path: impl Into<PathBuf>) -> Result<Self> {
        let lock = inferred_lock_mode(device).ok_or_else(|| {
            SandboxError::Config(format!("Invalid guest device name: {}", device))
        })?;
        Ok(Self::new(path, Some(lock)))
    }
}

/// A file created (or truncated) and zero-extended by the worker before exec
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preallocation {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub path: PathBuf,
    pub mode: LockMode,
}

/// Everything the `guest-exec` role needs, passed as `--plan <json>`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestPlan {
    pub argv: Vec<String>,
    pub locks: Vec<LockRequest>,
    pub preallocate: Vec<Preallocation>,
    pub console: Option<PathBuf>,
    pub nice_level: i32,
}

/// Declarative description of one guest-kernel invocation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub mem: String,
    pub uml_dir: Option<PathBuf>,
    pub disks: BTreeMap<String, DiskSpec>,
    pub network: BTreeMap<String, TapDevice>,
    pub extra_args: Vec<String>,
    pub command: Option<String>,
    pub nice_level: i32,
    /// Console log; `None` discards the console
    pub console: Option<PathBuf>,
    pub preallocate: Vec<Preallocation>,
    pub timeout: Duration,
}

impl LaunchSpec {
    pub fn new(kernel: impl Into<PathBuf>, initrd: impl Into<PathBuf>, mem: impl Into<String>) -> Self {
        Self {
            kernel: kernel.into(),
            initrd: initrd.into(),
            mem: mem.into(),
            uml_dir: None,
            disks: BTreeMap::new(),
            network: BTreeMap::new(),
            extra_args: Vec::new(),
            command: None,
            nice_level: 0,
            console: None,
            preallocate: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Final argument list, kernel path first
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![
            self.kernel.display().to_string(),
            format!("initrd={}", self.initrd.display()),
            format!("mem={}", self.mem),
        ];
        if let Some(dir) = &self.uml_dir {
            argv.push(format!("uml_dir={}", dir.display()));
        }
        for (device, disk) in &self.disks {
            argv.push(format!("{}={}", device, disk.path.display()));
        }
        for (iface, tap) in &self.network {
            argv.push(tap.guest_arg(iface));
        }
        argv.extend(self.extra_args.iter().cloned());
        argv.push(if self.console.is_some() {
            "con=null,fd:1".to_string()
        } else {
            "con=null".to_string()
        });
        if let Some(command) = &self.command {
            argv.push(command.clone());
        }
        argv
    }

    /// Locks the worker must hold before exec, in device-name order
    pub fn lock_requests(&self) -> Vec<LockRequest> {
        self.disks
            .values()
            .filter_map(|disk| {
                disk.lock.map(|mode| LockRequest {
                    path: disk.path.clone(),
                    mode,
                })
            })
            .collect()
    }

    pub fn plan(&self) -> GuestPlan {
        GuestPlan {
            argv: self.argv(),
            locks: self.lock_requests(),
            preallocate: self.preallocate.clone(),
            console: self.console.clone(),
            nice_level: self.nice_level,
        }
    }
}

/// One guest-kernel instance driven through a [`SupervisedGroup`]. The
/// specification can be replaced between runs with
/// [`set_options`](Self::set_options).
pub struct GuestLauncher {
    spec: Mutex<LaunchSpec>,
    group: SupervisedGroup,
}

impl GuestLauncher {
    pub fn new(helper: impl Into<PathBuf>, spec: LaunchSpec) -> Self {
        let timeout = spec.timeout;
        let helper = helper.into();
        let group = SupervisedGroup::with_helper(helper.clone(), timeout, WorkerCommand::new(helper));
        Self {
            spec: Mutex::new(spec),
            group,
        }
    }

    fn spec_guard(&self) -> MutexGuard<'_, LaunchSpec> {
        self.spec.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn options(&self) -> LaunchSpec {
        self.spec_guard().clone()
    }

    /// Replace the specification wholesale; takes effect at the next start
    pub fn set_options(&self, spec: LaunchSpec) {
        *self.spec_guard() = spec;
    }

    pub fn when_done<F>(&self, callback: F)
    where
        F: Fn(&RaceReport) + Send + Sync + 'static,
    {
        self.group.when_done(callback);
    }

    /// The worker command this launcher would run for the current spec
    pub fn worker_command(&self) -> Result<WorkerCommand> {
        let plan = serde_json::to_string(&self.spec_guard().plan())?;
        Ok(WorkerCommand::new(self.group.helper())
            .args(["--internal-role", "guest-exec", "--plan"])
            .arg(plan))
    }

    pub fn start(&self) -> Result<()> {
        if self.group.running() {
            return Err(SandboxError::AlreadyRunning);
        }
        let worker = self.worker_command()?;
        let spec = self.spec_guard();
        log::debug!("Launching guest: {}", spec.argv().join(" "));
        self.group.set_timeout(spec.timeout);
        drop(spec);
        self.group.set_worker(worker);
        self.group.start()
    }

    pub fn running(&self) -> bool {
        self.group.running()
    }

    pub fn wait(&self) -> Option<RaceReport> {
        self.group.wait()
    }

    pub fn kill(&self) -> Result<()> {
        self.group.kill()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> LaunchSpec {
        let mut spec = LaunchSpec::new("/k/linux", "/k/initrd.gz", "256M");
        spec.disks.insert(
            "ubdc".to_string(),
            DiskSpec::inferred("ubdc", "/w/0/output.tar").unwrap(),
        );
        spec.disks.insert(
            "ubdarc".to_string(),
            DiskSpec::inferred("ubdarc", "/k/rootfs.cow").unwrap(),
        );
        spec.disks.insert(
            "ubdbr".to_string(),
            DiskSpec::inferred("ubdbr", "/w/task.tar").unwrap(),
        );
        spec
    }

    #[test]
    fn test_device_name_pattern() {
        assert_eq!(device_flags("ubdarc"), Some("rc"));
        assert_eq!(device_flags("ubdc"), Some(""));
        assert_eq!(device_flags("ubdd"), Some(""));
        assert_eq!(device_flags("ubd"), None);
        assert_eq!(device_flags("sda"), None);
        assert_eq!(device_flags("ubdbx"), None);
        assert_eq!(device_flags("ubdBr"), None);
    }

    #[test]
    fn test_lock_intent_inference() {
        assert_eq!(inferred_lock_mode("ubdarc"), Some(LockMode::Shared));
        assert_eq!(inferred_lock_mode("ubdbr"), Some(LockMode::Shared));
        assert_eq!(inferred_lock_mode("ubddc"), Some(LockMode::Shared));
        assert_eq!(inferred_lock_mode("ubdc"), Some(LockMode::Exclusive));
        assert_eq!(inferred_lock_mode("ubdes"), Some(LockMode::Exclusive));
        assert!(DiskSpec::inferred("hda", "/x").is_err());
    }

    #[test]
    fn test_argv_layout() {
        let mut spec = sample_spec();
        spec.uml_dir = Some(PathBuf::from("/w/uml"));
        spec.network.insert(
            "eth0".to_string(),
            TapDevice::for_slot(0, 10).unwrap(),
        );
        spec.extra_args = vec!["quiet".to_string()];
        spec.console = Some(PathBuf::from("/w/0/vm.log"));
        spec.command = Some("run_tarred_script:/dev/ubdb".to_string());

        assert_eq!(
            spec.argv(),
            vec![
                "/k/linux",
                "initrd=/k/initrd.gz",
                "mem=256M",
                "uml_dir=/w/uml",
                "ubdarc=/k/rootfs.cow",
                "ubdbr=/w/task.tar",
                "ubdc=/w/0/output.tar",
                "eth0=tuntap,tap_tmc0,,192.168.10.1",
                "quiet",
                "con=null,fd:1",
                "run_tarred_script:/dev/ubdb",
            ]
        );
    }

    #[test]
    fn test_discarded_console_and_no_uml_dir() {
        let argv = sample_spec().argv();
        assert_eq!(argv.last().map(String::as_str), Some("con=null"));
        assert!(!argv.iter().any(|a| a.starts_with("uml_dir=")));
    }

    #[test]
    fn test_plan_carries_locks_in_device_order() {
        let mut spec = sample_spec();
        spec.disks
            .insert("ubdd".to_string(), DiskSpec::new("/scratch.img", None));
        let locks = spec.plan().locks;
        assert_eq!(
            locks,
            vec![
                LockRequest {
                    path: PathBuf::from("/k/rootfs.cow"),
                    mode: LockMode::Shared
                },
                LockRequest {
                    path: PathBuf::from("/w/task.tar"),
                    mode: LockMode::Shared
                },
                LockRequest {
                    path: PathBuf::from("/w/0/output.tar"),
                    mode: LockMode::Exclusive
                },
            ]
        );
    }

    #[test]
    fn test_worker_command_embeds_plan() {
        let launcher = GuestLauncher::new("/usr/bin/guestvisor", sample_spec());
        let worker = launcher.worker_command().unwrap();
        assert_eq!(worker.program, PathBuf::from("/usr/bin/guestvisor"));
        assert_eq!(&worker.args[..3], &["--internal-role", "guest-exec", "--plan"]);
        let plan: GuestPlan = serde_json::from_str(&worker.args[3]).unwrap();
        assert_eq!(plan, launcher.options().plan());
        assert!(!launcher.running());
    }
}
