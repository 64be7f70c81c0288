use std::{fmt, path::PathBuf, time::Duration};

use anyhow::Result;
use hikibridge_core::utils::mask;

use crate::{
    client::HttpIngestClient,
    delivery::{RetryPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_MAX_ATTEMPTS},
};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct Context {
    pub folder_path: PathBuf,
    pub api_endpoint: String,
    pub api_key: String,
    pub database_path: PathBuf,
    pub liveness_path: PathBuf,
    pub scan_interval: Duration,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub drain_grace: Duration,
    pub exit_after_sync: bool,
}

impl Context {
    pub fn new(
        folder_path: PathBuf,
        api_endpoint: String,
        api_key: String,
        database_path: PathBuf,
        liveness_path: PathBuf,
    ) -> Self {
        Self {
            folder_path,
            api_endpoint,
            api_key,
            database_path,
            liveness_path,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            drain_grace: DEFAULT_DRAIN_GRACE,
            exit_after_sync: false,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
        }
    }

    pub fn client(&self) -> Result<HttpIngestClient> {
        Ok(HttpIngestClient::new(
            self.api_endpoint.clone(),
            self.api_key.clone(),
        )?)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("folder_path", &self.folder_path)
            .field("api_endpoint", &self.api_endpoint)
            .field("api_key", &mask(&self.api_key))
            .field("database_path", &self.database_path)
            .field("liveness_path", &self.liveness_path)
            .field("scan_interval", &self.scan_interval)
            .field("queue_capacity", &self.queue_capacity)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .field("drain_grace", &self.drain_grace)
            .field("exit_after_sync", &self.exit_after_sync)
            .finish()
    }
}
