use std::{env, path::PathBuf, process, time::Duration};

use anyhow::{bail, Context, Result};
use hikibridge_core::{
    cancel::CancellationToken, config::AppPaths, logging::init_worker_logger, utils::mask,
};
use hikibridge_worker::{context::Context as WorkerContext, run};
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "hikibridge_monitor")]
struct Opt {
    #[structopt(parse(from_os_str))]
    folder_path: PathBuf,

    #[structopt(name = "api_endpoint")]
    api_endpoint: String,

    /// Name of the environment variable containing the API key
    #[structopt(long, default_value = "HIKIBRIDGE_API_KEY")]
    api_key_env: String,

    #[structopt(long, parse(from_os_str))]
    database: Option<PathBuf>,

    #[structopt(long, parse(from_os_str))]
    liveness_file: Option<PathBuf>,

    #[structopt(long)]
    scan_interval_ms: Option<u64>,

    #[structopt(long)]
    queue_capacity: Option<usize>,

    #[structopt(long)]
    max_attempts: Option<u32>,

    #[structopt(long)]
    exit_after_sync: bool,
}

impl Opt {
    fn to_context(&self, api_key: String) -> Result<WorkerContext> {
        let (database_path, liveness_path) = match (&self.database, &self.liveness_file) {
            (Some(database), Some(liveness_file)) => (database.clone(), liveness_file.clone()),
            (database, liveness_file) => {
                let paths = AppPaths::from_env()?;
                (
                    database.clone().unwrap_or(paths.database_file),
                    liveness_file.clone().unwrap_or(paths.liveness_file),
                )
            }
        };

        let mut context = WorkerContext::new(
            self.folder_path.clone(),
            self.api_endpoint.clone(),
            api_key,
            database_path,
            liveness_path,
        );
        if let Some(scan_interval_ms) = self.scan_interval_ms {
            context.scan_interval = Duration::from_millis(scan_interval_ms);
        }
        if let Some(queue_capacity) = self.queue_capacity {
            context.queue_capacity = queue_capacity;
        }
        if let Some(max_attempts) = self.max_attempts {
            context.max_attempts = max_attempts;
        }
        context.exit_after_sync = self.exit_after_sync;
        Ok(context)
    }
}

fn api_key(env_var: &str) -> Result<String> {
    match env::var(env_var) {
        Ok(api_key) if !api_key.is_empty() => Ok(api_key),
        _ => bail!("No API key found in environment variable {}", env_var),
    }
}

fn start() -> Result<()> {
    let opt = Opt::from_args();
    let api_key = api_key(&opt.api_key_env)?;
    let context = opt.to_context(api_key)?;

    log::info!("HikiBridge Monitor Started");
    log::info!("Monitoring folder: {}", context.folder_path.display());
    log::info!("API Endpoint: {}", context.api_endpoint);
    log::info!("API Key: {}", mask(&context.api_key));
    log::debug!("{:?}", context);

    let cancel = CancellationToken::new();
    let handler_cancel = cancel.clone();
    let drain_grace = context.drain_grace;
    ctrlc::set_handler(move || {
        log::info!("Termination requested, stopping");
        handler_cancel.cancel(drain_grace);
    })
    .context("Install termination handler")?;

    run::run(context, cancel)
}

fn main() {
    init_worker_logger();

    if let Err(error) = start() {
        log::error!("Monitor failed: {:#}", error);
        process::exit(1);
    }

    log::info!("Exit application");
}
