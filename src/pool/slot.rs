use crate::config::settings::Settings;
use crate::config::types::{LockMode, Result, SandboxError};
use crate::core::types::RaceReport;
use crate::guest::launch::{DiskSpec, GuestLauncher, LaunchSpec, Preallocation};
use crate::guest::network::TapDevice;
use crate::plugins::{HookContext, PluginManager};
use crate::pool::output::{interpret, TaskReport};
use crate::pool::workspace::SlotWorkspace;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Receives the report of one run, exactly once
pub type Notifier = Box<dyn FnOnce(TaskReport) + Send>;

pub const ROOTFS_DEVICE: &str = "ubdarc";
pub const ARTIFACT_DEVICE: &str = "ubdbr";
pub const OUTPUT_DEVICE: &str = "ubdc";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-slot launch parameters derived from [`Settings`]
#[derive(Clone, Debug)]
pub struct SlotTemplate {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub rootfs: PathBuf,
    pub mem: String,
    pub uml_dir: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub nice_level: i32,
    pub timeout: Duration,
    pub max_output_bytes: u64,
    pub tap: Option<TapDevice>,
}

impl SlotTemplate {
    pub fn from_settings(settings: &Settings, index: usize) -> Result<Self> {
        let tap = if settings.network.enabled {
            Some(TapDevice::for_slot(
                index,
                settings.network.private_ip_range_start,
            )?)
        } else {
            None
        };
        Ok(Self {
            kernel: settings.kernel_path.clone(),
            initrd: settings.initrd_path.clone(),
            rootfs: settings.rootfs_path.clone(),
            mem: settings.instance_ram.clone(),
            uml_dir: settings.uml_dir.clone(),
            extra_args: settings.extra_uml_args.clone(),
            nice_level: settings.nice_level,
            timeout: settings.timeout(),
            max_output_bytes: settings.max_output_bytes()?,
            tap,
        })
    }
}

struct ActiveTask {
    run_id: Uuid,
    artifact: PathBuf,
    started_at: DateTime<Utc>,
    notifier: Option<Notifier>,
}

/// One sandbox slot: a private working directory plus one guest launcher.
///
/// Idle -> (start) -> Busy -> (completion) -> Idle. `kill` forces Busy -> Idle
/// without a report.
pub struct SandboxSlot {
    index: usize,
    workspace: SlotWorkspace,
    template: SlotTemplate,
    plugins: Arc<PluginManager>,
    launcher: GuestLauncher,
    task: Arc<Mutex<Option<ActiveTask>>>,
    start_lock: Mutex<()>,
}

impl SandboxSlot {
    pub fn new(
        index: usize,
        work_dir: &Path,
        template: SlotTemplate,
        helper: &Path,
        plugins: Arc<PluginManager>,
    ) -> Self {
        let workspace = SlotWorkspace::new(work_dir, index);
        let launcher = GuestLauncher::new(
            helper,
            LaunchSpec::new(&template.kernel, &template.initrd, template.mem.clone()),
        );
        let task: Arc<Mutex<Option<ActiveTask>>> = Arc::new(Mutex::new(None));

        {
            let task = task.clone();
            let output_image = workspace.output_image();
            launcher.when_done(move |report: &RaceReport| {
                complete(index, &task, &output_image, report);
            });
        }

        Self {
            index,
            workspace,
            template,
            plugins,
            launcher,
            task,
            start_lock: Mutex::new(()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn workspace(&self) -> &SlotWorkspace {
        &self.workspace
    }

    pub fn busy(&self) -> bool {
        self.launcher.running()
    }

    pub fn idle(&self) -> bool {
        !self.busy()
    }

    /// Artifact of the run in flight
    pub fn current_artifact(&self) -> Option<PathBuf> {
        lock(&self.task).as_ref().map(|t| t.artifact.clone())
    }

    /// Launch spec for `artifact`: the fixed disks, plugin images and network
    fn launch_spec(&self, artifact: &Path, extra_images: Vec<(String, PathBuf)>) -> Result<LaunchSpec> {
        let t = &self.template;
        let mut spec = LaunchSpec::new(&t.kernel, &t.initrd, t.mem.clone());
        spec.uml_dir = t.uml_dir.clone();
        spec.extra_args = t.extra_args.clone();
        spec.nice_level = t.nice_level;
        spec.timeout = t.timeout;
        spec.console = Some(self.workspace.vm_log());

        for (device, path) in extra_images {
            spec.disks.insert(device.clone(), DiskSpec::inferred(&device, path)?);
        }
        // Fixed disks win over plugin images with the same device name.
        spec.disks.insert(
            ROOTFS_DEVICE.to_string(),
            DiskSpec::new(&t.rootfs, Some(LockMode::Shared)),
        );
        spec.disks.insert(
            ARTIFACT_DEVICE.to_string(),
            DiskSpec::new(artifact, Some(LockMode::Shared)),
        );
        let output = self.workspace.output_image();
        spec.disks.insert(
            OUTPUT_DEVICE.to_string(),
            DiskSpec::new(&output, Some(LockMode::Exclusive)),
        );
        spec.preallocate.push(Preallocation {
            path: output,
            size: t.max_output_bytes,
        });

        if let Some(tap) = &t.tap {
            spec.network.insert("eth0".to_string(), tap.clone());
        }
        Ok(spec)
    }

    /// Run `artifact` in this slot. Rejects immediately with `SlotBusy` while
    /// a previous run is in flight. Returns the new run's id.
    pub fn start<F>(&self, artifact: &Path, notifier: F) -> Result<Uuid>
    where
        F: FnOnce(TaskReport) + Send + 'static,
    {
        let _starting = lock(&self.start_lock);
        if self.busy() {
            return Err(SandboxError::SlotBusy(self.index));
        }

        debug!("Instance {}: Clearing work dir", self.index);
        self.workspace.reset()?;

        let extra_images = self.plugins.extra_images(self.index);
        self.plugins.before_exec(&HookContext {
            slot: self.index,
            artifact,
        });

        let spec = self.launch_spec(artifact, extra_images.into_iter().collect())?;
        self.launcher.set_options(spec);

        let run_id = Uuid::new_v4();
        *lock(&self.task) = Some(ActiveTask {
            run_id,
            artifact: artifact.to_path_buf(),
            started_at: Utc::now(),
            notifier: Some(Box::new(notifier)),
        });

        if let Err(e) = self.launcher.start() {
            warn!("Instance {}: failed to start guest: {}", self.index, e);
            *lock(&self.task) = None;
            return Err(e);
        }
        info!(
            "Instance {}: started run {} for {}",
            self.index,
            run_id,
            artifact.display()
        );
        Ok(run_id)
    }

    /// Force the slot back to idle; no report is delivered for the run.
    /// Serialised with [`start`](Self::start), so a run started concurrently
    /// is never cleared by a kill aimed at its predecessor.
    pub fn kill(&self) -> Result<()> {
        let _transition = lock(&self.start_lock);
        if self.busy() {
            info!("Instance {}: killing current run", self.index);
        }
        self.launcher.kill()?;
        *lock(&self.task) = None;
        Ok(())
    }

    /// Block until the run in flight (if any) has completed and notified
    pub fn wait(&self) {
        self.launcher.wait();
    }
}

fn complete(index: usize, task: &Mutex<Option<ActiveTask>>, output_image: &Path, report: &RaceReport) {
    let Some(mut active) = lock(task).take() else {
        debug!("Instance {}: completion without an active task", index);
        return;
    };

    let (status, exit_code, output) = interpret(&report.outcome, output_image);
    debug!(
        "Instance {}: Status: {}. Exit code: {:?}. Outcome: {:?}",
        index, status, exit_code, report.outcome
    );

    let task_report = TaskReport {
        run_id: active.run_id,
        slot: index,
        status,
        exit_code,
        output,
        started_at: active.started_at,
        finished_at: Utc::now(),
    };
    if let Some(notifier) = active.notifier.take() {
        notifier(task_report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn idle_slot(work: &Path) -> SandboxSlot {
        let template = SlotTemplate::from_settings(&Settings::default(), 0).unwrap();
        SandboxSlot::new(
            0,
            work,
            template,
            Path::new("/bin/false"),
            Arc::new(PluginManager::default()),
        )
    }

    #[test]
    fn test_kill_waits_for_an_in_progress_start() {
        let work = tempfile::tempdir().unwrap();
        let slot = Arc::new(idle_slot(work.path()));

        let starting = lock(&slot.start_lock);
        let (tx, rx) = mpsc::channel();
        let killer = {
            let slot = slot.clone();
            std::thread::spawn(move || {
                slot.kill().unwrap();
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        drop(starting);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        killer.join().unwrap();
        assert!(slot.idle());
    }

    #[test]
    fn test_launch_spec_fixed_disks_win() {
        let work = tempfile::tempdir().unwrap();
        let slot = idle_slot(work.path());
        let artifact = Path::new("/tasks/a.tar");
        let spec = slot
            .launch_spec(
                artifact,
                vec![
                    ("ubdbr".to_string(), PathBuf::from("/plugin/shadow.img")),
                    ("ubdd".to_string(), PathBuf::from("/plugin/cache.img")),
                ],
            )
            .unwrap();

        assert_eq!(spec.disks["ubdbr"].path, artifact);
        assert_eq!(spec.disks["ubdc"].lock, Some(LockMode::Exclusive));
        assert_eq!(spec.disks["ubdd"].path, PathBuf::from("/plugin/cache.img"));
        assert_eq!(spec.preallocate[0].path, slot.workspace().output_image());
        assert_eq!(spec.console, Some(slot.workspace().vm_log()));
    }
}
