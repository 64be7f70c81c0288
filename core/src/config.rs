use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde_derive::{Deserialize, Serialize};

use crate::error::ConfigError;

const APP_FOLDER_NAME: &str = "hikibridge";
const CONFIG_FILE_NAME: &str = "config.json";
const LIVENESS_FILE_NAME: &str = "monitor.pid";
const DATABASE_FILE_NAME: &str = "snapshot.sqlite3";

/// Operator settings, persisted as json. Missing fields take their default value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_endpoint: String,
    pub api_key: String,
    pub folder_path: String,
    pub auto_start: bool,
    pub windows_startup: bool,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(error) => {
                return Err(error).context(format!("Read config file at '{}'", path.display()))
            }
        };

        serde_json::from_str(&raw).context(format!("Parse config file at '{}'", path.display()))
    }

    /// Like `load`, but a broken config file is logged and replaced by defaults
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(error) => {
                log::error!("Failed to load config: {:#}", error);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Create config folder '{}'", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self).context("Serialize config")?;
        fs::File::create(path)
            .and_then(|mut file| file.write_all(raw.as_bytes()))
            .context(format!("Write config file at '{}'", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_endpoint.trim().is_empty() {
            return Err(ConfigError::MissingApiEndpoint);
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if self.folder_path.trim().is_empty() {
            return Err(ConfigError::MissingFolderPath);
        }
        if !Path::new(&self.folder_path).is_dir() {
            return Err(ConfigError::FolderNotFound(PathBuf::from(&self.folder_path)));
        }
        Ok(())
    }
}

fn default_config_folder() -> Result<PathBuf, ConfigError> {
    Ok(dirs::config_dir()
        .or_else(dirs::home_dir)
        .ok_or(ConfigError::UnableToFindHomeUser)?
        .join(APP_FOLDER_NAME))
}

fn default_state_folder() -> Result<PathBuf, ConfigError> {
    Ok(dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .ok_or(ConfigError::UnableToFindHomeUser)?
        .join(APP_FOLDER_NAME))
}

/// Where the application reads and writes its files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub liveness_file: PathBuf,
    pub database_file: PathBuf,
}

impl AppPaths {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(&default_config_folder()?, &default_state_folder()?))
    }

    /// Use given config file and state folder, user folders are only looked up
    /// for what is not given
    pub fn resolve(
        config_file: Option<PathBuf>,
        state_folder: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let config_file = match config_file {
            Some(config_file) => config_file,
            None => default_config_folder()?.join(CONFIG_FILE_NAME),
        };
        let state_folder = match state_folder {
            Some(state_folder) => state_folder,
            None => default_state_folder()?,
        };

        Ok(Self {
            config_file,
            ..Self::new(&state_folder, &state_folder)
        })
    }

    pub fn new(config_folder: &Path, state_folder: &Path) -> Self {
        Self {
            config_file: config_folder.join(CONFIG_FILE_NAME),
            liveness_file: state_folder.join(LIVENESS_FILE_NAME),
            database_file: state_folder.join(DATABASE_FILE_NAME),
        }
    }

    pub fn ensure_state_folder(&self) -> io::Result<()> {
        for path in [&self.liveness_file, &self.database_file] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}
