/// `static_images`: hands the same fixed disk images to every slot.
///
/// ```json
/// "plugins": { "static_images": { "enabled": true,
///     "options": { "images": { "ubddrc": "/srv/images/deps.img" } } } }
/// ```
use crate::config::settings::{PluginSettings, Settings};
use crate::config::types::{Result, SandboxError};
use crate::guest::launch::device_flags;
use crate::plugins::Plugin;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Options {
    #[serde(default)]
    images: BTreeMap<String, PathBuf>,
}

#[derive(Debug)]
pub struct StaticImages {
    images: BTreeMap<String, PathBuf>,
}

impl StaticImages {
    pub fn new(images: BTreeMap<String, PathBuf>) -> Result<Self> {
        for device in images.keys() {
            if device_flags(device).is_none() {
                return Err(SandboxError::Config(format!(
                    "static_images: invalid device name {}",
                    device
                )));
            }
        }
        Ok(Self { images })
    }

    pub fn construct(plugin: &PluginSettings, _settings: &Settings) -> Result<Box<dyn Plugin>> {
        let options: Options = if plugin.options.is_null() {
            Options::default()
        } else {
            serde_json::from_value(plugin.options.clone())
                .map_err(|e| SandboxError::Config(format!("static_images options: {}", e)))?
        };
        Ok(Box::new(Self::new(options.images)?))
    }
}

impl Plugin for StaticImages {
    fn name(&self) -> &str {
        "static_images"
    }

    fn extra_images(&self, _slot: usize) -> Result<BTreeMap<String, PathBuf>> {
        Ok(self.images.clone())
    }
}
