//! Persisted per-sensor settings.
//!
//! The node remembers the last configuration applied to each sensor so it can be
//! restored at startup (`load_sensors_configurations`). Settings live in their own
//! TOML file, keyed by sensor id:
//!
//! ```toml
//! [sensors.rpi_B1A104]
//! clock_source = 1
//! dlpf_mode = 0
//! rate = 9
//! full_scale_accel_range = 0
//! full_scale_gyro_range = 0
//! accel_fifo_enabled = true
//! x_gyro_fifo_enabled = false
//! y_gyro_fifo_enabled = false
//! z_gyro_fifo_enabled = false
//! ```
//!
//! Keys the node does not know about are kept as written.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AppResult;
use crate::hardware::SensorConfig;

/// Stored settings of one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSettings {
    /// Known register settings
    #[serde(flatten)]
    pub config: SensorConfig,
    /// Unrecognized keys, written back unchanged
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl From<SensorConfig> for SensorSettings {
    fn from(config: SensorConfig) -> Self {
        Self {
            config,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    sensors: BTreeMap<String, SensorSettings>,
}

/// File-backed map of sensor id to settings. Every mutation is saved immediately.
#[derive(Debug)]
pub struct SensorSettingsStore {
    path: PathBuf,
    file: SettingsFile,
}

impl SensorSettingsStore {
    /// Load the store; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let file = if path.exists() {
            toml::from_str(&fs::read_to_string(&path)?)?
        } else {
            debug!(path = %path.display(), "no persisted sensor settings");
            SettingsFile::default()
        };
        Ok(Self { path, file })
    }

    /// Stored settings of `sensor_id`, if any.
    pub fn get(&self, sensor_id: &str) -> Option<&SensorSettings> {
        self.file.sensors.get(sensor_id)
    }

    /// Ids with stored settings, in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.file.sensors.keys().map(String::as_str)
    }

    /// Store the configuration of `sensor_id`, keeping its unknown keys.
    pub fn set(&mut self, sensor_id: &str, config: SensorConfig) -> AppResult<()> {
        match self.file.sensors.get_mut(sensor_id) {
            Some(settings) => settings.config = config,
            None => {
                self.file
                    .sensors
                    .insert(sensor_id.to_string(), SensorSettings::from(config));
            }
        }
        self.save()
    }

    /// Forget `sensor_id`. Returns whether anything was stored.
    pub fn remove(&mut self, sensor_id: &str) -> AppResult<bool> {
        let removed = self.file.sensors.remove(sensor_id).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Write the store, creating parent directories.
    pub fn save(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, toml::to_string(&self.file)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{AccelRange, DlpfMode};
    use tempfile::TempDir;

    fn accel_only() -> SensorConfig {
        SensorConfig {
            dlpf_mode: DlpfMode::Bw256,
            rate: 9,
            full_scale_accel_range: AccelRange::G4,
            accel_fifo_enabled: true,
            ..SensorConfig::default()
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SensorSettingsStore::open(dir.path().join("absent.toml")).unwrap();
        assert_eq!(store.ids().count(), 0);
    }

    #[test]
    fn set_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/settings.toml");
        let mut store = SensorSettingsStore::open(&path).unwrap();
        store.set("rpi_B1A104", accel_only()).unwrap();

        let reloaded = SensorSettingsStore::open(&path).unwrap();
        assert_eq!(reloaded.get("rpi_B1A104").unwrap().config, accel_only());
    }

    #[test]
    fn remove_deletes_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        let mut store = SensorSettingsStore::open(&path).unwrap();
        store.set("rpi_B1A104", accel_only()).unwrap();
        assert!(store.remove("rpi_B1A104").unwrap());
        assert!(!store.remove("rpi_B1A104").unwrap());

        let reloaded = SensorSettingsStore::open(&path).unwrap();
        assert!(reloaded.get("rpi_B1A104").is_none());
    }

    #[test]
    fn unknown_keys_survive_updates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(
            &path,
            r#"
[sensors.rpi_B1A104]
clock_source = 1
dlpf_mode = 0
rate = 9
full_scale_accel_range = 1
full_scale_gyro_range = 0
accel_fifo_enabled = true
x_gyro_fifo_enabled = false
y_gyro_fifo_enabled = false
z_gyro_fifo_enabled = false
placement = "left wrist"
"#,
        )
        .unwrap();

        let mut store = SensorSettingsStore::open(&path).unwrap();
        let settings = store.get("rpi_B1A104").unwrap();
        assert_eq!(settings.config.rate, 9);
        assert_eq!(
            settings.extra.get("placement"),
            Some(&toml::Value::String("left wrist".into()))
        );

        store.set("rpi_B1A104", SensorConfig::default()).unwrap();
        let reloaded = SensorSettingsStore::open(&path).unwrap();
        let settings = reloaded.get("rpi_B1A104").unwrap();
        assert_eq!(settings.config, SensorConfig::default());
        assert!(settings.extra.contains_key("placement"));
    }
}
