use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::supervisor::SupervisorState;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Unable to {action} monitoring while {state}")]
    InvalidState {
        state: SupervisorState,
        action: &'static str,
    },
    #[error("Failed to start monitoring process: {0}")]
    Spawn(io::Error),
    #[error("Monitoring process gave no heartbeat within {0:?}")]
    StartupTimeout(Duration),
    #[error("Monitoring process exited during startup")]
    ExitedDuringStartup,
    #[error("Monitoring process startup interrupted")]
    Interrupted,
    #[error("Failed to signal process {0}: {1}")]
    Signal(u32, String),
    #[error("Supervisor lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum AutostartError {
    #[error("Unable to write {0}: {1}")]
    Write(PathBuf, io::Error),
    #[error("Unable to remove {0}: {1}")]
    Remove(PathBuf, io::Error),
    #[error("Unable to read {0}: {1}")]
    Read(PathBuf, io::Error),
    #[error("Registry command failed: {0}")]
    Registry(String),
    #[error("Run at login is not supported on {0}")]
    Unsupported(&'static str),
    #[error("Unable to determine user home path")]
    UnableToFindHomeUser,
}
