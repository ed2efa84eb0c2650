/// Typed runtime settings: built-in defaults deep-merged with a JSON file
use crate::config::types::{Result, SandboxError};
use crate::utils::size::parse_byte_spec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub max_instances: usize,
    pub timeout_secs: u64,
    /// Passed verbatim as the guest's `mem=` argument
    pub instance_ram: String,
    /// Byte spec such as "5M"; size of each slot's output disk
    pub max_output_size: String,
    pub work_dir: PathBuf,
    pub kernel_path: PathBuf,
    pub initrd_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub uml_dir: Option<PathBuf>,
    /// Binary re-executed for the internal process roles. Defaults to the
    /// running executable when unset.
    pub helper_binary: Option<PathBuf>,
    pub nice_level: i32,
    pub extra_uml_args: Vec<String>,
    pub network: NetworkSettings,
    pub plugins: BTreeMap<String, PluginSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSettings {
    pub enabled: bool,
    /// Third octet used for slot 0; slot i uses start + i
    pub private_ip_range_start: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub options: Value,
}

impl Settings {
    /// Built-in defaults as a JSON document, the base layer of every merge
    pub fn defaults_value() -> Result<Value> {
        Ok(serde_json::to_value(Self::default())?)
    }

    /// Deserialize settings from a fully merged JSON value
    pub fn from_value(value: Value) -> Result<Self> {
        let settings: Settings = serde_json::from_value(value)
            .map_err(|e| SandboxError::Config(format!("Invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults, optionally overlaid with a JSON settings file
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut merged = Self::defaults_value()?;
        if let Some(path) = path {
            let content = std::fs::read_to_string(path).map_err(|e| {
                SandboxError::Config(format!(
                    "Failed to read settings file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let overlay: Value = serde_json::from_str(&content).map_err(|e| {
                SandboxError::Config(format!(
                    "Failed to parse settings file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            deep_merge(&mut merged, overlay);
        }
        Self::from_value(merged)
    }

    /// Apply `overrides` on top of these settings with the same deep-merge rules
    pub fn merge(&self, overrides: Value) -> Result<Self> {
        let mut base = serde_json::to_value(self)?;
        deep_merge(&mut base, overrides);
        Self::from_value(base)
    }

    fn validate(&self) -> Result<()> {
        if self.max_instances == 0 {
            return Err(SandboxError::Config(
                "max_instances must be at least 1".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(SandboxError::Config(
                "timeout_secs must be at least 1".to_string(),
            ));
        }
        if usize::from(self.network.private_ip_range_start) + self.max_instances > 256 {
            return Err(SandboxError::Config(format!(
                "private_ip_range_start {} leaves no room for {} instances",
                self.network.private_ip_range_start, self.max_instances
            )));
        }
        parse_byte_spec(&self.max_output_size)?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_output_bytes(&self) -> Result<u64> {
        parse_byte_spec(&self.max_output_size)
    }

    /// The configured helper binary or the running executable
    pub fn helper_path(&self) -> Result<PathBuf> {
        match &self.helper_binary {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_instances: 1,
            timeout_secs: 10,
            instance_ram: "256M".to_string(),
            max_output_size: "5M".to_string(),
            work_dir: PathBuf::from("/var/lib/guestvisor/instances"),
            kernel_path: PathBuf::from("/usr/local/lib/guestvisor/linux"),
            initrd_path: PathBuf::from("/usr/local/lib/guestvisor/initrd.gz"),
            rootfs_path: PathBuf::from("/usr/local/lib/guestvisor/rootfs.cow"),
            uml_dir: None,
            helper_binary: None,
            nice_level: 0,
            extra_uml_args: Vec::new(),
            network: NetworkSettings {
                enabled: false,
                private_ip_range_start: 10,
            },
            plugins: BTreeMap::new(),
        }
    }
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other value in the overlay replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.max_output_bytes().unwrap(), 5 * 1024 * 1024);
        assert!(!settings.network.enabled);
    }

    #[test]
    fn test_file_overlay_deep_merges() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_instances": 4, "network": {{"enabled": true}},
                "plugins": {{"static_images": {{"enabled": true,
                             "options": {{"images": {{"ubdd": "/tmp/x"}}}}}}}}}}"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.max_instances, 4);
        assert!(settings.network.enabled);
        // untouched sibling key survives the nested merge
        assert_eq!(settings.network.private_ip_range_start, 10);
        assert!(settings.plugins["static_images"].enabled);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = Settings::default()
            .merge(json!({"max_instancez": 2}))
            .unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));

        let err = Settings::default()
            .merge(json!({"network": {"bogus": true}}))
            .unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[test]
    fn test_merge_overrides_and_validates() {
        let settings = Settings::default()
            .merge(json!({"timeout_secs": 3, "max_output_size": "1M"}))
            .unwrap();
        assert_eq!(settings.timeout(), Duration::from_secs(3));
        assert_eq!(settings.max_output_bytes().unwrap(), 1 << 20);

        assert!(Settings::default().merge(json!({"max_instances": 0})).is_err());
        assert!(Settings::default()
            .merge(json!({"max_output_size": "lots"}))
            .is_err());
    }

    #[test]
    fn test_deep_merge_replaces_non_objects() {
        let mut base = json!({"a": {"b": 1, "c": [1, 2]}, "d": 1});
        deep_merge(&mut base, json!({"a": {"c": [3]}, "d": {"e": 2}}));
        assert_eq!(base, json!({"a": {"b": 1, "c": [3]}, "d": {"e": 2}}));
    }
}
