//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/labsync.toml` (base configuration)
//! 2. Environment variables prefixed with `LABSYNC_`, nested keys separated
//!    by `__` (e.g. `LABSYNC_ACQUISITION__POLL_INTERVAL=500ms`)
//!
//! Every section has defaults, so an empty or missing file yields a usable
//! configuration with no devices.
//!
//! # Example
//! ```no_run
//! use labsync::config::LabsyncConfig;
//!
//! let config = LabsyncConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), labsync::config::ConfigError>(())
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use labsync_core::limits::{
    COMMAND_TIMEOUT, MAX_CONSECUTIVE_FAILURES, POLL_INTERVAL, SETTLE_DELAY, STATUS_READ_TIMEOUT,
};
use labsync_core::InstrumentClass;
use labsync_experiment::{SweepRequest, SweepSettings};
use labsync_hardware::{DeviceConfig, RegistrySettings};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogFormat;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/labsync.toml";

/// Prefix of overriding environment variables.
pub const ENV_PREFIX: &str = "LABSYNC_";

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The sources could not be merged or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Values were read but are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabsyncConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Status polling
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Bode sweep instruments and defaults
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Device registry tunables
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Preset storage
    #[serde(default)]
    pub presets: PresetConfig,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Acquisition loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Time between polling rounds
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Upper bound for one status read
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
}

/// Sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Frequency generator device id
    #[serde(default = "default_generator")]
    pub generator: String,
    /// Spectrum analyzer device id
    #[serde(default = "default_analyzer")]
    pub analyzer: String,
    /// Wait between setting the generator and measuring
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,
    /// Write analyzer Bode settings before the first point
    #[serde(default = "default_true")]
    pub bode_defaults: bool,
    /// Default start frequency in Hz
    #[serde(default = "default_start_hz")]
    pub start_hz: f64,
    /// Default stop frequency in Hz
    #[serde(default = "default_stop_hz")]
    pub stop_hz: f64,
    /// Default number of points
    #[serde(default = "default_points")]
    pub points: usize,
}

/// Device registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Reply bound for one driver transaction
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,
    /// Consecutive timeouts or device errors before a device goes to Error
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
}

/// Preset storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetConfig {
    /// Directory holding `<name>.toml` presets
    #[serde(default = "default_preset_dir")]
    pub directory: PathBuf,
}

// Default value functions
fn default_name() -> String {
    "labsync".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> Duration {
    POLL_INTERVAL
}

fn default_read_timeout() -> Duration {
    STATUS_READ_TIMEOUT
}

fn default_generator() -> String {
    "gen".to_string()
}

fn default_analyzer() -> String {
    "fsv".to_string()
}

fn default_settle_delay() -> Duration {
    SETTLE_DELAY
}

fn default_true() -> bool {
    true
}

fn default_start_hz() -> f64 {
    1.0e3
}

fn default_stop_hz() -> f64 {
    1.0e6
}

fn default_points() -> usize {
    31
}

fn default_command_timeout() -> Duration {
    COMMAND_TIMEOUT
}

fn default_max_failures() -> u32 {
    MAX_CONSECUTIVE_FAILURES
}

fn default_preset_dir() -> PathBuf {
    PathBuf::from("presets")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            read_timeout: default_read_timeout(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            generator: default_generator(),
            analyzer: default_analyzer(),
            settle_delay: default_settle_delay(),
            bode_defaults: true,
            start_hz: default_start_hz(),
            stop_hz: default_stop_hz(),
            points: default_points(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            command_timeout: default_command_timeout(),
            max_consecutive_failures: default_max_failures(),
        }
    }
}

impl Default for PresetConfig {
    fn default() -> Self {
        Self {
            directory: default_preset_dir(),
        }
    }
}

impl SweepConfig {
    /// Instruments and timing for the coordinator.
    pub fn settings(&self) -> SweepSettings {
        let settings = SweepSettings::new(self.generator.as_str(), self.analyzer.as_str())
            .with_settle_delay(self.settle_delay);
        if self.bode_defaults {
            settings
        } else {
            settings.without_bode_defaults()
        }
    }

    /// The configured default sweep.
    pub fn request(&self) -> SweepRequest {
        SweepRequest {
            start_hz: self.start_hz,
            stop_hz: self.stop_hz,
            points: self.points,
        }
    }
}

impl RegistryConfig {
    /// Tunables for the registry.
    pub fn settings(&self) -> RegistrySettings {
        RegistrySettings {
            command_timeout: self.command_timeout,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}

impl LabsyncConfig {
    /// Load from `config/labsync.toml` and the environment, then validate.
    ///
    /// Environment variables override the file with prefix `LABSYNC_`.
    /// Example: `LABSYNC_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.acquisition.poll_interval.is_zero() {
            return invalid("acquisition.poll_interval must be greater than zero".into());
        }
        if self.acquisition.read_timeout.is_zero() {
            return invalid("acquisition.read_timeout must be greater than zero".into());
        }
        if self.registry.command_timeout.is_zero() {
            return invalid("registry.command_timeout must be greater than zero".into());
        }
        if self.registry.max_consecutive_failures == 0 {
            return invalid("registry.max_consecutive_failures must be at least 1".into());
        }

        let sweep = &self.sweep;
        if sweep.points < 2 {
            return invalid(format!("sweep.points must be at least 2, got {}", sweep.points));
        }
        if !(sweep.start_hz > 0.0 && sweep.start_hz < sweep.stop_hz && sweep.stop_hz.is_finite()) {
            return invalid(format!(
                "sweep range must satisfy 0 < start_hz < stop_hz, got {} .. {}",
                sweep.start_hz, sweep.stop_hz
            ));
        }

        // Validate device IDs and physical resources are unique
        let mut ids = HashSet::new();
        let mut resources = HashSet::new();
        for device in &self.devices {
            if !device.id.is_well_formed() {
                return invalid(format!(
                    "Device ID '{}' must use lowercase letters, digits or '_'",
                    device.id
                ));
            }
            if !ids.insert(device.id.clone()) {
                return invalid(format!("Duplicate device ID: {}", device.id));
            }
            let resource = device.driver.resource();
            if !resources.insert(resource.clone()) {
                return invalid(format!("Device {} reuses resource {}", device.id, resource));
            }
        }

        self.check_sweep_role(&sweep.generator, InstrumentClass::FrequencyGenerator)?;
        self.check_sweep_role(&sweep.analyzer, InstrumentClass::SpectrumAnalyzer)?;

        Ok(())
    }

    fn check_sweep_role(&self, id: &str, class: InstrumentClass) -> Result<(), ConfigError> {
        match self.devices.iter().find(|d| d.id.as_str() == id) {
            Some(device) if device.driver.class() != class => Err(ConfigError::Invalid(format!(
                "sweep device '{}' is a {:?}, expected {:?}",
                id,
                device.driver.class(),
                class
            ))),
            _ => Ok(()),
        }
    }

    /// Mark every device as simulated.
    pub fn simulate_all(&mut self) {
        for device in &mut self.devices {
            device.simulated = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use labsync_core::DeviceId;
    use labsync_hardware::DriverType;

    const BENCH: &str = r#"
        [application]
        name = "Optics bench"
        log_level = "debug"

        [acquisition]
        poll_interval = "250ms"

        [sweep]
        settle_delay = "50ms"

        [[devices]]
        id = "gen"
        name = "Function generator"
        [devices.driver]
        type = "tga1244"
        port = "/dev/ttyS1"

        [[devices]]
        id = "fsv"
        name = "Spectrum analyzer"
        [devices.driver]
        type = "fsv3000"
        host = "192.168.1.20"
    "#;

    #[test]
    fn test_load_config() {
        Jail::expect_with(|jail| {
            jail.create_file("labsync.toml", BENCH)?;
            let config = LabsyncConfig::load_from("labsync.toml").map_err(|e| e.to_string())?;

            assert_eq!(config.application.name, "Optics bench");
            assert_eq!(config.acquisition.poll_interval, Duration::from_millis(250));
            assert_eq!(config.acquisition.read_timeout, STATUS_READ_TIMEOUT);
            assert_eq!(config.sweep.settings().settle_delay, Duration::from_millis(50));
            assert_eq!(config.devices.len(), 2);
            assert_eq!(
                config.devices[1].driver,
                DriverType::Fsv3000 {
                    host: "192.168.1.20".into(),
                    port: 5025
                }
            );
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("labsync.toml", BENCH)?;
            jail.set_env("LABSYNC_ACQUISITION__POLL_INTERVAL", "1s");
            jail.set_env("LABSYNC_REGISTRY__MAX_CONSECUTIVE_FAILURES", "5");

            let config = LabsyncConfig::load_from("labsync.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.acquisition.poll_interval, Duration::from_secs(1));
            assert_eq!(config.registry.settings().max_consecutive_failures, 5);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let config = LabsyncConfig::load_from("absent.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.acquisition.poll_interval, POLL_INTERVAL);
            assert_eq!(config.presets.directory, PathBuf::from("presets"));
            assert!(config.devices.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = LabsyncConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_device_ids() {
        let device = DeviceConfig {
            id: DeviceId::new("stage0"),
            name: "Stage".into(),
            driver: DriverType::EcoVario {
                port: "/dev/ttyS0".into(),
            },
            simulated: false,
        };
        let mut config = LabsyncConfig::default();
        config.devices = vec![device.clone(), device];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shared_port_is_rejected() {
        let mut config = LabsyncConfig::default();
        config.devices = vec![
            DeviceConfig {
                id: DeviceId::new("stage0"),
                name: "Stage".into(),
                driver: DriverType::EcoVario {
                    port: "/dev/ttyS0".into(),
                },
                simulated: false,
            },
            DeviceConfig {
                id: DeviceId::new("gen"),
                name: "Generator".into(),
                driver: DriverType::Tga1244 {
                    port: "/dev/ttyS0".into(),
                },
                simulated: false,
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sweep_roles_must_match_classes() {
        let mut config = LabsyncConfig::default();
        config.devices = vec![DeviceConfig {
            id: DeviceId::new("gen"),
            name: "Not a generator".into(),
            driver: DriverType::LuxxPlus {
                port: "/dev/ttyUSB0".into(),
            },
            simulated: false,
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_sweep_range() {
        let mut config = LabsyncConfig::default();
        config.sweep.start_hz = 1.0e6;
        config.sweep.stop_hz = 1.0e3;
        assert!(config.validate().is_err());
    }
}
