//! Preset store.
//!
//! Saves and restores the in-memory parameter sets of every registered device
//! as TOML files (`<directory>/<name>.toml`):
//!
//! ```toml
//! name = "bode_bench"
//! version = 1
//!
//! [devices.gen]
//! channel = 1
//! "frequency[1]" = 1000.0
//!
//! [devices.stage0]
//! target_position = 12.5
//! ```
//!
//! Loading only replaces in-memory values; nothing is sent to the instruments
//! until [`DeviceRegistry::apply_parameters`] is called. Files are written to a
//! temporary sibling first and renamed into place, so a failed save never
//! leaves a truncated preset behind. Output is deterministic: saving, loading
//! and saving again produces the same bytes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use labsync_core::error::{LabError, LabResult};
use labsync_core::{DeviceId, ParameterValue};
use labsync_hardware::DeviceRegistry;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::PresetConfig;

/// Current preset file format.
pub const PRESET_VERSION: u32 = 1;

const EXTENSION: &str = "toml";

/// On-disk preset document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetRecord {
    /// Preset name, equal to the file stem
    pub name: String,
    /// File format version
    pub version: u32,
    /// Parameter values per device, keys in display form (`frequency[2]`)
    pub devices: BTreeMap<DeviceId, BTreeMap<String, ParameterValue>>,
}

impl PresetRecord {
    /// Serialize to TOML.
    pub fn to_toml(&self) -> LabResult<String> {
        toml::to_string(self).map_err(|e| LabError::Parse(format!("preset '{}': {}", self.name, e)))
    }

    /// Parse TOML and check the format version.
    pub fn from_toml(text: &str) -> LabResult<Self> {
        let record: Self = toml::from_str(text).map_err(|e| LabError::Parse(e.to_string()))?;
        if record.version != PRESET_VERSION {
            return Err(LabError::Parse(format!(
                "preset '{}' has version {}, expected {}",
                record.name, record.version, PRESET_VERSION
            )));
        }
        Ok(record)
    }
}

/// Filesystem-backed preset storage bound to a registry.
pub struct PresetStore {
    registry: Arc<DeviceRegistry>,
    directory: PathBuf,
}

impl std::fmt::Debug for PresetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresetStore")
            .field("registry", &"<Arc<DeviceRegistry>>")
            .field("directory", &self.directory)
            .finish()
    }
}

impl PresetStore {
    /// Store presets for `registry` under `directory`.
    pub fn new(registry: Arc<DeviceRegistry>, directory: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            directory: directory.into(),
        }
    }

    /// Store using the `[presets]` configuration section.
    pub fn from_config(registry: Arc<DeviceRegistry>, config: &PresetConfig) -> Self {
        Self::new(registry, config.directory.clone())
    }

    /// Preset directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Get path to a preset file
    fn preset_path(&self, name: &str) -> LabResult<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(LabError::Config(format!(
                "preset name '{}' must use letters, digits, '_' or '-'",
                name
            )));
        }
        Ok(self.directory.join(format!("{}.{}", name, EXTENSION)))
    }

    /// Snapshot the in-memory parameters of every registered device.
    pub fn capture(&self, name: &str) -> LabResult<PresetRecord> {
        let mut devices = BTreeMap::new();
        for id in self.registry.device_ids() {
            let parameters = self.registry.parameters(&id)?;
            devices.insert(id, parameters.values().clone());
        }
        Ok(PresetRecord {
            name: name.to_string(),
            version: PRESET_VERSION,
            devices,
        })
    }

    /// Write the current parameters as preset `name`, replacing any previous
    /// file of that name.
    pub async fn save(&self, name: &str) -> LabResult<PathBuf> {
        let path = self.preset_path(name)?;
        let text = self.capture(name)?.to_toml()?;

        fs::create_dir_all(&self.directory).await?;
        let staging = path.with_extension(format!("{}.tmp", EXTENSION));
        let written = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(text.as_bytes()).await?;
            file.sync_all().await?;
            fs::rename(&staging, &path).await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }

        info!(preset = name, path = %path.display(), "Saved preset");
        Ok(path)
    }

    /// Read preset `name` without applying it.
    pub async fn read(&self, name: &str) -> LabResult<PresetRecord> {
        let path = self.preset_path(name)?;
        let text = fs::read_to_string(&path).await?;
        PresetRecord::from_toml(&text)
    }

    /// Load preset `name` into the in-memory parameter sets.
    ///
    /// Every value is validated before anything is replaced; on error no
    /// device is changed. Devices the registry does not know are skipped.
    /// No command reaches the instruments.
    pub async fn load(&self, name: &str) -> LabResult<PresetRecord> {
        let record = self.read(name).await?;
        self.apply_record(&record)?;
        info!(preset = name, devices = record.devices.len(), "Loaded preset");
        Ok(record)
    }

    /// Replace in-memory parameters from `record`, all or nothing.
    pub fn apply_record(&self, record: &PresetRecord) -> LabResult<()> {
        let known: Vec<(&DeviceId, &BTreeMap<String, ParameterValue>)> = record
            .devices
            .iter()
            .filter(|(id, _)| {
                let registered = self.registry.state(id).is_ok();
                if !registered {
                    warn!(preset = %record.name, device = %id, "Preset names an unknown device; skipping");
                }
                registered
            })
            .collect();

        // Validate against copies first.
        for (id, values) in &known {
            let mut candidate = self.registry.parameters(id)?;
            candidate.replace_all(values)?;
        }
        for (id, values) in known {
            self.registry.replace_parameters(id, values)?;
        }
        Ok(())
    }

    /// Names of the presets in the directory, sorted.
    pub async fn list(&self) -> LabResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labsync_hardware::{DeviceConfig, DriverType};

    fn store(dir: &Path) -> PresetStore {
        let registry = DeviceRegistry::new();
        registry
            .register(DeviceConfig {
                id: DeviceId::new("laser0"),
                name: "Laser".into(),
                driver: DriverType::LuxxPlus {
                    port: "/dev/ttyUSB0".into(),
                },
                simulated: true,
            })
            .unwrap();
        PresetStore::new(Arc::new(registry), dir)
    }

    #[test]
    fn test_record_layout() {
        let dir = tempfile::tempdir().unwrap();
        let record = store(dir.path()).capture("bench").unwrap();
        let text = record.to_toml().unwrap();

        assert!(text.starts_with("name = \"bench\"\nversion = 1\n"));
        assert!(text.contains("[devices.laser0]"));
        assert_eq!(PresetRecord::from_toml(&text).unwrap(), record);
    }

    #[test]
    fn test_unknown_version_is_a_parse_error() {
        let err = PresetRecord::from_toml("name = \"x\"\nversion = 9\n[devices]\n").unwrap_err();
        assert!(matches!(err, LabError::Parse(_)));
    }

    #[test]
    fn test_bad_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.preset_path("../escape").is_err());
        assert!(store.preset_path("").is_err());
        assert!(store.preset_path("bode-1kHz_v2").is_ok());
    }

    #[tokio::test]
    async fn test_list_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save("beta").await.unwrap();
        store.save("alpha").await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_preset_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = store(dir.path()).load("nope").await.unwrap_err();
        assert!(matches!(err, LabError::Io(_)));
    }
}
