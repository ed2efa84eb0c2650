use crate::config::settings::Settings;
use crate::config::types::Result;
use crate::plugins::PluginManager;
use crate::pool::slot::{SandboxSlot, SlotTemplate};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub busy_instances: usize,
    pub total_instances: usize,
    /// 1, 5 and 15 minute load averages, when the host exposes them
    pub loadavg: Option<[f64; 3]>,
}

/// Fixed-size set of independent sandbox slots
pub struct SandboxPool {
    slots: Vec<Arc<SandboxSlot>>,
    plugins: Arc<PluginManager>,
}

impl SandboxPool {
    /// `max_instances` slots rooted at `work_dir`, plugins built from settings
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let plugins = PluginManager::from_settings(settings)?;
        Self::new(settings, plugins)
    }

    pub fn new(settings: &Settings, plugins: PluginManager) -> Result<Self> {
        let helper = settings.helper_path()?;
        let plugins = Arc::new(plugins);
        let mut slots = Vec::with_capacity(settings.max_instances);
        for index in 0..settings.max_instances {
            let template = SlotTemplate::from_settings(settings, index)?;
            slots.push(Arc::new(SandboxSlot::new(
                index,
                &settings.work_dir,
                template,
                &helper,
                plugins.clone(),
            )));
        }
        info!(
            "Sandbox pool ready: {} instance(s) under {}",
            slots.len(),
            settings.work_dir.display()
        );
        Ok(Self { slots, plugins })
    }

    pub fn slots(&self) -> &[Arc<SandboxSlot>] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&Arc<SandboxSlot>> {
        self.slots.get(index)
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    /// First idle slot, or `None` when the system is busy
    pub fn claim_idle(&self) -> Option<Arc<SandboxSlot>> {
        self.slots.iter().find(|slot| slot.idle()).cloned()
    }

    /// Kill every slot. All slots are attempted; the first error is returned.
    pub fn kill_all(&self) -> Result<()> {
        let mut first_err = None;
        for slot in &self.slots {
            if let Err(e) = slot.kill() {
                warn!("Instance {}: kill failed: {}", slot.index(), e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn wait_all(&self) {
        for slot in &self.slots {
            slot.wait();
        }
    }

    /// Kill all slots, then give every plugin its shutdown hook
    pub fn shut_down(&self) -> Result<()> {
        let result = self.kill_all();
        self.plugins.shut_down();
        result
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            busy_instances: self.slots.iter().filter(|s| s.busy()).count(),
            total_instances: self.slots.len(),
            loadavg: read_loadavg(Path::new("/proc/loadavg")),
        }
    }
}

fn read_loadavg(path: &Path) -> Option<[f64; 3]> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut fields = content.split_whitespace().map(|f| f.parse::<f64>().ok());
    Some([fields.next()??, fields.next()??, fields.next()??])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(work: &Path, instances: usize) -> Settings {
        Settings::default()
            .merge(json!({
                "max_instances": instances,
                "work_dir": work,
                "helper_binary": "/bin/false",
            }))
            .unwrap()
    }

    #[test]
    fn test_idle_pool_status() {
        let work = tempfile::tempdir().unwrap();
        let pool = SandboxPool::from_settings(&settings(work.path(), 3)).unwrap();

        let status = pool.status();
        assert_eq!(status.busy_instances, 0);
        assert_eq!(status.total_instances, 3);
        assert_eq!(pool.claim_idle().map(|s| s.index()), Some(0));
        // nothing running: both are immediate no-ops
        pool.kill_all().unwrap();
        pool.wait_all();
    }

    #[test]
    fn test_loadavg_parsing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"0.52 0.58 0.59 1/467 12345\n").unwrap();
        assert_eq!(read_loadavg(file.path()), Some([0.52, 0.58, 0.59]));

        std::fs::write(file.path(), "garbage").unwrap();
        assert_eq!(read_loadavg(file.path()), None);
    }

    #[test]
    fn test_network_slots_get_distinct_taps() {
        let work = tempfile::tempdir().unwrap();
        let settings = settings(work.path(), 2)
            .merge(json!({"network": {"enabled": true, "private_ip_range_start": 20}}))
            .unwrap();
        let first = SlotTemplate::from_settings(&settings, 0).unwrap();
        let second = SlotTemplate::from_settings(&settings, 1).unwrap();
        assert_eq!(first.tap.unwrap().name, "tap_tmc0");
        assert_eq!(
            second.tap.unwrap().ip_addr,
            std::net::Ipv4Addr::new(192, 168, 21, 1)
        );
    }
}
