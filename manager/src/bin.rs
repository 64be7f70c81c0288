use std::{path::PathBuf, process, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use hikibridge_core::{
    config::{AppConfig, AppPaths},
    liveness::LivenessFile,
    logging::init_logger,
    utils::mask,
};
use hikibridge_manager::{
    autostart::{launch_command, platform_autostart, Autostart, Verification},
    supervisor::{
        stop_detached, Supervisor, SupervisorConfig, SupervisorState, WorkerCommand,
        DEFAULT_STOP_GRACE,
    },
};
use hikibridge_worker::{
    database::connection,
    snapshot::{DiskSnapshotStore, SnapshotStore},
};
use structopt::StructOpt;

const EXIT_CRASHED: i32 = 2;
const OUTPUT_POLL: Duration = Duration::from_millis(200);

#[derive(StructOpt, Debug)]
#[structopt(name = "hikibridge", about = "Forward folder changes to an ingestion API")]
struct Opt {
    /// Config file to use instead of the user one
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Folder for liveness file and snapshot database instead of the user one
    #[structopt(long, parse(from_os_str))]
    state_folder: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Subcommand,
}

#[derive(StructOpt, Debug)]
enum Subcommand {
    /// Entry point registered for login: run monitoring if auto start is set
    Launch,
    /// Start monitoring and stream its output until interrupted
    Run,
    /// Stop a running monitoring process
    Stop,
    /// Tell if monitoring process is running
    Status,
    Config(ConfigCommand),
    Autostart(AutostartCommand),
    /// List changes which could not be delivered
    DeadLetters,
}

#[derive(StructOpt, Debug)]
enum ConfigCommand {
    Show,
    Set {
        #[structopt(long)]
        api_endpoint: Option<String>,
        #[structopt(long)]
        api_key: Option<String>,
        #[structopt(long)]
        folder_path: Option<String>,
        #[structopt(long)]
        auto_start: Option<bool>,
    },
}

#[derive(StructOpt, Debug)]
enum AutostartCommand {
    Enable,
    Disable,
    Status,
    Verify,
}

impl Opt {
    fn paths(&self) -> Result<AppPaths> {
        Ok(AppPaths::resolve(
            self.config.clone(),
            self.state_folder.clone(),
        )?)
    }
}

fn run(paths: &AppPaths) -> Result<i32> {
    let config = AppConfig::load(&paths.config_file)?;
    config.validate()?;
    config.save(&paths.config_file)?;
    paths
        .ensure_state_folder()
        .context("Create state folder")?;

    if let Some(pid) = LivenessFile::new(paths.liveness_file.clone()).running_pid() {
        log::error!("Monitoring process already running (pid {})", pid);
        return Ok(1);
    }

    let (output_sender, output_receiver) = unbounded();
    let supervisor = Arc::new(Supervisor::new(
        SupervisorConfig {
            liveness_file: Some(paths.liveness_file.clone()),
            ..SupervisorConfig::default()
        },
        Some(output_sender),
    ));

    let handler_supervisor = supervisor.clone();
    ctrlc::set_handler(move || {
        log::info!("Stop requested");
        if let Err(error) = handler_supervisor.stop() {
            log::error!("{}", error);
        }
    })
    .context("Install termination handler")?;

    // Lines written during startup stay buffered in the channel
    let command = WorkerCommand::monitor(&config, paths).context("Locate monitor program")?;
    let started = supervisor.start(&command);
    if let Err(error) = started {
        print_lines(&output_receiver);
        log::error!("{}", error);
        return Ok(EXIT_CRASHED);
    }

    // Until the worker finish, by crash or by stop
    let code = loop {
        match output_receiver.recv_timeout(OUTPUT_POLL) {
            Ok(line) => println!("{}", line),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }

        match supervisor.state() {
            SupervisorState::Running | SupervisorState::Starting | SupervisorState::Stopping => {}
            SupervisorState::Stopped => break 0,
            SupervisorState::Crashed => {
                log::error!(
                    "Monitoring process crashed ({:?})",
                    supervisor.exit_status()
                );
                break EXIT_CRASHED;
            }
        }
    };

    print_lines(&output_receiver);
    Ok(code)
}

fn print_lines(output_receiver: &Receiver<String>) {
    for line in output_receiver.try_iter() {
        println!("{}", line);
    }
}

fn status(paths: &AppPaths) -> Result<i32> {
    match LivenessFile::new(paths.liveness_file.clone()).running_pid() {
        Some(pid) => println!("Monitoring is running (pid {})", pid),
        None => println!("Monitoring is not running"),
    }
    Ok(0)
}

fn stop(paths: &AppPaths) -> Result<i32> {
    let liveness = LivenessFile::new(paths.liveness_file.clone());
    if stop_detached(&liveness, DEFAULT_STOP_GRACE)? {
        println!("Monitoring stopped");
    } else {
        println!("Monitoring is not running");
    }
    Ok(0)
}

fn launch(paths: &AppPaths) -> Result<i32> {
    let config = AppConfig::load_or_default(&paths.config_file);
    if config.auto_start {
        log::info!("Auto start is enabled, start monitoring");
        run(paths)
    } else {
        status(paths)
    }
}

fn config(paths: &AppPaths, command: &ConfigCommand) -> Result<i32> {
    let mut config = AppConfig::load(&paths.config_file)?;

    match command {
        ConfigCommand::Show => {}
        ConfigCommand::Set {
            api_endpoint,
            api_key,
            folder_path,
            auto_start,
        } => {
            if let Some(api_endpoint) = api_endpoint {
                config.api_endpoint = api_endpoint.clone();
            }
            if let Some(api_key) = api_key {
                config.api_key = api_key.clone();
            }
            if let Some(folder_path) = folder_path {
                config.folder_path = folder_path.clone();
            }
            if let Some(auto_start) = auto_start {
                config.auto_start = *auto_start;
            }
            if let Err(error) = config.validate() {
                log::warn!("Config is incomplete: {}", error);
            }
            config.save(&paths.config_file)?;
            log::info!("Config saved to {}", paths.config_file.display());
        }
    }

    println!("Config file: {}", paths.config_file.display());
    println!("API Endpoint: {}", config.api_endpoint);
    println!("API Key: {}", mask(&config.api_key));
    println!("Folder Path: {}", config.folder_path);
    println!("Auto start: {}", config.auto_start);
    println!("Run at login: {}", config.windows_startup);
    Ok(0)
}

fn autostart(paths: &AppPaths, command: &AutostartCommand) -> Result<i32> {
    let autostart: Box<dyn Autostart> =
        platform_autostart(launch_command().context("Locate current program")?)?;

    match command {
        AutostartCommand::Enable | AutostartCommand::Disable => {
            let enable = matches!(command, AutostartCommand::Enable);
            if enable {
                autostart.enable()?;
            } else {
                autostart.disable()?;
            }
            let mut config = AppConfig::load(&paths.config_file)?;
            config.windows_startup = enable;
            config.save(&paths.config_file)?;
            println!("Run at login {}", if enable { "enabled" } else { "disabled" });
        }
        AutostartCommand::Status => {
            if autostart.is_enabled()? {
                println!("Run at login is enabled");
            } else {
                println!("Run at login is disabled");
            }
        }
        AutostartCommand::Verify => match autostart.verify()? {
            Verification::Configured(command) => println!("Registered: {}", command),
            Verification::NotRegistered => {
                println!("Not registered");
                return Ok(1);
            }
            Verification::Mismatch { expected, found } => {
                println!("Registered command differ: found {} expected {}", found, expected);
                return Ok(1);
            }
        },
    }

    Ok(0)
}

fn dead_letters(paths: &AppPaths) -> Result<i32> {
    if !paths.database_file.exists() {
        println!("No dead letter");
        return Ok(0);
    }

    let store = DiskSnapshotStore::new(connection(&paths.database_file)?);
    store.create_tables()?;
    let dead_letters = store.dead_letters()?;
    if dead_letters.is_empty() {
        println!("No dead letter");
    }
    for dead_letter in dead_letters {
        println!(
            "{} {} {} after {} attempt(s): {}",
            dead_letter.failed_at.to_rfc3339(),
            dead_letter.kind,
            dead_letter.path,
            dead_letter.attempts,
            dead_letter.last_error
        );
    }
    Ok(0)
}

fn main_() -> Result<i32> {
    let opt = Opt::from_args();
    let paths = opt.paths()?;

    match &opt.command {
        Subcommand::Launch => launch(&paths),
        Subcommand::Run => run(&paths),
        Subcommand::Stop => stop(&paths),
        Subcommand::Status => status(&paths),
        Subcommand::Config(command) => config(&paths, command),
        Subcommand::Autostart(command) => autostart(&paths, command),
        Subcommand::DeadLetters => dead_letters(&paths),
    }
}

fn main() {
    init_logger();

    match main_() {
        Ok(code) => process::exit(code),
        Err(error) => {
            log::error!("{:#}", error);
            process::exit(1);
        }
    }
}
