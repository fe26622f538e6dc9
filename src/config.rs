use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::mirror::MirrorEngineType;
use crate::core::models::TargetLayout;
use crate::error::ConfigError;

pub const CONFIG_PATH: &str = "/etc/usbmirrord/config.toml";
const ENV_PREFIX: &str = "USBMIRRORD_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root under which every device gets its mirror directory.
    pub backup_directory: PathBuf,
    /// Mountpoint basenames that are never backed up.
    pub excluded_names: BTreeSet<String>,
    pub poll_interval_secs: u64,
    pub query_timeout_secs: u64,
    pub mirror_engine: MirrorEngineType,
    pub target_layout: TargetLayout,
    /// Consecutive failures after which a still-mounted device is left alone
    /// until it is unplugged. Unset retries forever.
    pub max_mirror_attempts: Option<u32>,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    /// Reserved system mountpoints, with the reason each one is reserved.
    /// Kept last: TOML tables must follow plain values.
    pub forbidden_mountpoints: BTreeMap<PathBuf, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let forbidden_mountpoints = [
            ("/", "root filesystem"),
            ("/boot", "boot partition"),
            ("/home", "user home directories"),
            ("/var", "system state"),
            ("/tmp", "temporary files"),
        ]
        .into_iter()
        .map(|(path, reason)| (PathBuf::from(path), reason.to_string()))
        .collect();

        Self {
            backup_directory: PathBuf::from("/srv/usb-backup"),
            excluded_names: ["Backup_drv", "data"].into_iter().map(String::from).collect(),
            poll_interval_secs: 15,
            query_timeout_secs: 10,
            mirror_engine: MirrorEngineType::default(),
            target_layout: TargetLayout::default(),
            max_mirror_attempts: None,
            simulation: false,
            verbose: false,
            json_logs: false,
            forbidden_mountpoints,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, the TOML file, `USBMIRRORD_*`
    /// environment variables and finally `overrides` (usually CLI args).
    pub fn new<T: Serialize>(
        config_file: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, ConfigError> {
        let file = config_file.unwrap_or(Path::new(CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Zero("poll_interval_secs"));
        }
        if self.query_timeout_secs == 0 {
            return Err(ConfigError::Zero("query_timeout_secs"));
        }
        if self.max_mirror_attempts == Some(0) {
            return Err(ConfigError::Zero("max_mirror_attempts"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Create the backup root if needed. The daemon must not start when
    /// this fails.
    pub fn prepare_backup_directory(&self) -> Result<(), ConfigError> {
        let path = &self.backup_directory;

        std::fs::create_dir_all(path).map_err(|source| ConfigError::BackupDirectory {
            path: path.clone(),
            source,
        })?;

        if !path.is_dir() {
            return Err(ConfigError::NotADirectory(path.clone()));
        }
        Ok(())
    }
}
