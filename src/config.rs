use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_hid_device() -> PathBuf {
    PathBuf::from("/dev/hidg0")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/etc/fido2_security_key")
}

fn default_store_file() -> String {
    "keys.secret".to_string()
}

fn default_button_pin() -> u32 {
    26
}

fn default_led_pin() -> u32 {
    16
}

fn default_benchmarking() -> bool {
    true
}

/// Daemon configuration. Defaults match the historical deployment; a JSON
/// file may override any subset of fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_hid_device")]
    pub hid_device: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_store_file")]
    pub store_file: String,
    #[serde(default = "default_button_pin")]
    pub button_pin: u32,
    #[serde(default = "default_led_pin")]
    pub led_pin: u32,
    #[serde(default = "default_benchmarking")]
    pub benchmarking: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hid_device: default_hid_device(),
            data_dir: default_data_dir(),
            store_file: default_store_file(),
            button_pin: default_button_pin(),
            led_pin: default_led_pin(),
            benchmarking: default_benchmarking(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("no config file at {}, using defaults", path.display());
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        log::info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.store_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment() {
        let config = Config::default();
        assert_eq!(config.hid_device, PathBuf::from("/dev/hidg0"));
        assert_eq!(
            config.store_path(),
            PathBuf::from("/etc/fido2_security_key/keys.secret")
        );
        assert_eq!(config.button_pin, 26);
        assert_eq!(config.led_pin, 16);
        assert!(config.benchmarking);
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"benchmarking": false, "button_pin": 5}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert!(!config.benchmarking);
        assert_eq!(config.button_pin, 5);
        assert_eq!(config.led_pin, 16);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/config.json")).unwrap();
        assert_eq!(config.store_file, "keys.secret");
    }
}
