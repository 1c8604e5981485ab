//! Configuration file handling

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use msr605x::{Coercivity, ReadFormat, SessionConfig};
use serde::{Deserialize, Serialize};

use crate::card::FileFormat;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub card: CardConfig,
    pub output: OutputConfig,
}

impl Config {
    /// Get the config file path for this platform
    pub fn path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "magstripe").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load config from file, or create default if it doesn't exist
    pub fn load_or_create() -> Result<Self, Box<dyn Error>> {
        let path = Self::path().ok_or("could not determine config directory")?;

        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&contents)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_with_header()?;
            tracing::info!("created default config at {}", path.display());
            Ok(config)
        }
    }

    /// Save config with header comments for new files
    pub fn save_with_header(&self) -> Result<(), Box<dyn Error>> {
        let path = Self::path().ok_or("could not determine config directory")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let header = r#"# magstripe configuration file
# durations accept humantime strings, e.g. "250ms" or "15s"

"#;
        let contents = toml::to_string_pretty(self)?;
        fs::write(&path, format!("{header}{contents}"))?;
        Ok(())
    }

    /// Exchange timing for a device session
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            poll_interval: self.device.poll_interval,
            command_timeout: self.device.command_timeout,
            swipe_timeout: self.device.swipe_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Hot-plug polling interval, also the longest single blocking read
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Timeout for commands answered without a card
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Timeout for reads, writes and erases waiting on a swipe
    #[serde(with = "humantime_serde")]
    pub swipe_timeout: Duration,
    /// Fixed hidraw path, otherwise the first attached device is used
    pub path: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            poll_interval: session.poll_interval,
            command_timeout: session.command_timeout,
            swipe_timeout: session.swipe_timeout,
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardConfig {
    /// Coercivity set before every write and erase
    pub coercivity: Coercivity,
    /// Default transfer format for reads and writes
    pub format: ReadFormat,
    /// Upper case track 1 data before writing, as the firmware expects
    pub uppercase_track1: bool,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            coercivity: Coercivity::Hi,
            format: ReadFormat::Iso,
            uppercase_track1: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for saved card files, defaults to the working directory
    pub directory: Option<PathBuf>,
    /// Saved card file format
    pub format: FileFormat,
}
