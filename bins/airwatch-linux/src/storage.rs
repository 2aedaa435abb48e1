//! Settings file and environment overrides.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use airwatch_core::{ConfigError, ConfigStorage, Settings};

pub const PUSH_URL_ENV: &str = "AIRWATCH_PUSH_URL";
pub const API_URL_ENV: &str = "AIRWATCH_API_URL";

/// Settings stored as a JSON document on disk.
pub struct FileConfigStorage {
    path: PathBuf,
}

impl FileConfigStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, writing the defaults on first run.
    pub fn load_or_init(&self) -> Result<Settings, ConfigError> {
        match self.load_settings() {
            Ok(settings) => Ok(settings),
            Err(ConfigError::NotFound(_)) => {
                let settings = Settings::default();
                self.save_settings(&settings)?;
                Ok(settings)
            }
            Err(e) => Err(e),
        }
    }
}

impl ConfigStorage for FileConfigStorage {
    fn load_settings(&self) -> Result<Settings, ConfigError> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(self.path.display().to_string()))
            }
            Err(e) => return Err(ConfigError::ReadError(e.to_string())),
        };

        let settings: Settings =
            serde_json::from_str(&json).map_err(|e| ConfigError::InvalidData(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn save_settings(&self, settings: &Settings) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        }
        std::fs::write(&self.path, json).map_err(|e| ConfigError::WriteError(e.to_string()))
    }
}

/// Apply `AIRWATCH_PUSH_URL` / `AIRWATCH_API_URL`. Returns the variables used.
pub fn apply_env_overrides(settings: &mut Settings) -> Vec<&'static str> {
    apply_overrides(settings, |name| std::env::var(name).ok())
}

fn apply_overrides<F>(settings: &mut Settings, lookup: F) -> Vec<&'static str>
where
    F: Fn(&str) -> Option<String>,
{
    let mut applied = Vec::new();

    if let Some(url) = lookup(PUSH_URL_ENV).filter(|url| !url.is_empty()) {
        settings.transport.push_url = url;
        applied.push(PUSH_URL_ENV);
    }
    if let Some(url) = lookup(API_URL_ENV).filter(|url| !url.is_empty()) {
        settings.transport.api_base_url = url;
        applied.push(API_URL_ENV);
    }

    applied
}
