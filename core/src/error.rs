use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("API Endpoint is required")]
    MissingApiEndpoint,
    #[error("API Key is required")]
    MissingApiKey,
    #[error("Folder Path is required")]
    MissingFolderPath,
    #[error("Selected folder does not exist: {0}")]
    FolderNotFound(PathBuf),
    #[error("Unable to determine user home path")]
    UnableToFindHomeUser,
}

#[derive(Debug, Error)]
pub enum LivenessError {
    #[error("Could not write liveness file {0}: {1}")]
    Write(PathBuf, io::Error),
    #[error("Could not remove liveness file {0}: {1}")]
    Remove(PathBuf, io::Error),
    #[error("Could not read liveness file {0}: {1}")]
    Read(PathBuf, io::Error),
}
