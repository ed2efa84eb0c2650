//! Plugins
//!
//! Collaborators that contribute extra disk images to a slot and run side
//! effects before each guest starts. Plugins are compiled in and selected by
//! key from the `plugins` settings table through [`BUILTIN_PLUGINS`].
//!
//! Hook failures never reach the sandbox: [`PluginManager`] logs and drops
//! every error or panic a plugin produces.

pub mod static_images;

use crate::config::settings::{PluginSettings, Settings};
use crate::config::types::{Result, SandboxError};
use crate::guest::launch::device_flags;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

/// Arguments of the `before_exec` hook
#[derive(Clone, Copy, Debug)]
pub struct HookContext<'a> {
    pub slot: usize,
    pub artifact: &'a Path,
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Side effects right before the slot's guest starts
    fn before_exec(&self, _ctx: &HookContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Device name -> backing file. Device names must follow the
    /// `ubd<letter><flags>` pattern; read-only and copy-on-write images get a
    /// shared lock, the rest an exclusive one.
    fn extra_images(&self, _slot: usize) -> Result<BTreeMap<String, PathBuf>> {
        Ok(BTreeMap::new())
    }

    /// Called once, best-effort, during process shutdown
    fn shut_down(&self) -> Result<()> {
        Ok(())
    }
}

pub type PluginCtor = fn(&PluginSettings, &Settings) -> Result<Box<dyn Plugin>>;

/// Settings key -> constructor
pub const BUILTIN_PLUGINS: &[(&str, PluginCtor)] =
    &[("static_images", static_images::StaticImages::construct as PluginCtor)];

pub fn lookup_builtin(key: &str) -> Option<PluginCtor> {
    BUILTIN_PLUGINS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, ctor)| *ctor)
}

#[derive(Default)]
pub struct PluginManager {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginManager {
    pub fn new(plugins: Vec<Box<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    /// Construct every enabled plugin, in sorted key order
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut plugins = Vec::new();
        for (key, plugin_settings) in &settings.plugins {
            if !plugin_settings.enabled {
                continue;
            }
            let ctor = lookup_builtin(key).ok_or_else(|| {
                SandboxError::Config(format!("Unknown plugin: {}", key))
            })?;
            debug!("Loading plugin: {}", key);
            plugins.push(ctor(plugin_settings, settings)?);
        }
        Ok(Self { plugins })
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Call `hook` on every plugin, keeping only the successful results
    fn dispatch<T, F>(&self, hook: &str, call: F) -> Vec<T>
    where
        F: Fn(&dyn Plugin) -> Result<T>,
    {
        let mut results = Vec::with_capacity(self.plugins.len());
        for plugin in &self.plugins {
            match catch_unwind(AssertUnwindSafe(|| call(&**plugin))) {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(e)) => debug!(
                    "Plugin hook {}.{} failed: {}",
                    plugin.name(),
                    hook,
                    e
                ),
                Err(_) => debug!("Plugin hook {}.{} panicked", plugin.name(), hook),
            }
        }
        results
    }

    pub fn before_exec(&self, ctx: &HookContext<'_>) {
        self.dispatch("before_exec", |p| p.before_exec(ctx));
    }

    /// Merged images from every plugin. Invalid device names are skipped;
    /// on duplicates the later plugin (in load order) wins.
    pub fn extra_images(&self, slot: usize) -> BTreeMap<String, PathBuf> {
        let mut merged = BTreeMap::new();
        for images in self.dispatch("extra_images", |p| p.extra_images(slot)) {
            for (device, path) in images {
                if device_flags(&device).is_none() {
                    warn!("Ignoring plugin image with invalid device name {}", device);
                    continue;
                }
                merged.insert(device, path);
            }
        }
        merged
    }

    pub fn shut_down(&self) {
        self.dispatch("shut_down", |p| p.shut_down());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        calls: Arc<AtomicUsize>,
        image: (&'static str, &'static str),
    }

    impl Plugin for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn before_exec(&self, _ctx: &HookContext<'_>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn extra_images(&self, _slot: usize) -> Result<BTreeMap<String, PathBuf>> {
            let mut images = BTreeMap::new();
            images.insert(self.image.0.to_string(), PathBuf::from(self.image.1));
            Ok(images)
        }
    }

    struct Broken;

    impl Plugin for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn before_exec(&self, _ctx: &HookContext<'_>) -> Result<()> {
            panic!("plugin bug");
        }
        fn extra_images(&self, _slot: usize) -> Result<BTreeMap<String, PathBuf>> {
            Err(SandboxError::Plugin {
                plugin: "broken".to_string(),
                message: "no images today".to_string(),
            })
        }
        fn shut_down(&self) -> Result<()> {
            Err(SandboxError::Process("daemon already gone".to_string()))
        }
    }

    #[test]
    fn test_failing_plugins_do_not_stop_others() {
        let calls = Arc::new(AtomicUsize::new(0));
        let plugins: Vec<Box<dyn Plugin>> = vec![
            Box::new(Broken),
            Box::new(Counting {
                calls: calls.clone(),
                image: ("ubddr", "/images/deps.img"),
            }),
        ];
        let manager = PluginManager::new(plugins);

        let artifact = PathBuf::from("/tmp/task.tar");
        manager.before_exec(&HookContext {
            slot: 0,
            artifact: &artifact,
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let images = manager.extra_images(0);
        assert_eq!(images.len(), 1);
        assert_eq!(images["ubddr"], PathBuf::from("/images/deps.img"));

        manager.shut_down();
    }

    #[test]
    fn test_invalid_device_names_are_skipped() {
        let plugin: Box<dyn Plugin> = Box::new(Counting {
            calls: Arc::new(AtomicUsize::new(0)),
            image: ("sdb", "/images/x.img"),
        });
        let manager = PluginManager::new(vec![plugin]);
        assert!(manager.extra_images(3).is_empty());
    }

    #[test]
    fn test_from_settings_rejects_unknown_enabled_plugin() {
        let settings = Settings::default()
            .merge(serde_json::json!({
                "plugins": {
                    "maven_cache": {"enabled": true},
                    "scratch_space": {"enabled": false}
                }
            }))
            .unwrap();
        let err = PluginManager::from_settings(&settings).err().unwrap();
        assert!(matches!(err, SandboxError::Config(msg) if msg.contains("maven_cache")));
    }

    #[test]
    fn test_disabled_unknown_plugin_is_ignored() {
        let settings = Settings::default()
            .merge(serde_json::json!({"plugins": {"scratch_space": {"enabled": false}}}))
            .unwrap();
        let manager = PluginManager::from_settings(&settings).unwrap();
        assert!(manager.is_empty());
    }
}
