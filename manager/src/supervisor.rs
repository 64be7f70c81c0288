use std::{
    env,
    ffi::OsString,
    io::{BufRead, BufReader, Read},
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use hikibridge_core::{
    config::{AppConfig, AppPaths},
    liveness::{is_process_alive, LivenessFile},
    DEFAULT_API_KEY_ENV_VAR, HEARTBEAT_MARKER, MONITOR_BIN_NAME,
};
use strum_macros::Display;

use crate::error::SupervisorError;

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum SupervisorState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

/// Program, arguments and environment used to spawn the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: PathBuf, args: Vec<OsString>) -> Self {
        Self {
            program,
            args,
            envs: vec![],
        }
    }

    /// Monitor binary installed next to current executable. API key is given
    /// by environment so it never appears in process list.
    pub fn monitor(config: &AppConfig, paths: &AppPaths) -> std::io::Result<Self> {
        let program = env::current_exe()?
            .parent()
            .map(|folder| folder.join(format!("{}{}", MONITOR_BIN_NAME, env::consts::EXE_SUFFIX)))
            .unwrap_or_else(|| PathBuf::from(MONITOR_BIN_NAME));

        Ok(Self {
            program,
            args: vec![
                OsString::from(&config.folder_path),
                OsString::from(&config.api_endpoint),
                OsString::from("--database"),
                paths.database_file.clone().into_os_string(),
                OsString::from("--liveness-file"),
                paths.liveness_file.clone().into_os_string(),
            ],
            envs: vec![(DEFAULT_API_KEY_ENV_VAR.to_string(), config.api_key.clone())],
        })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so stop reach worker children too
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    /// Liveness file written by the worker, removed on stop if worker didn't
    pub liveness_file: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            liveness_file: None,
        }
    }
}

#[derive(Default)]
struct Inner {
    state: SupervisorState,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
    stop_requested: bool,
}

/// Own the worker process lifecycle. Methods take `&self` so that a
/// supervisor can be stopped from another thread (signal handler) while
/// `start` is waiting for the first heartbeat.
pub struct Supervisor {
    config: SupervisorConfig,
    inner: Arc<Mutex<Inner>>,
    child: Arc<Mutex<Option<Child>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    output_sender: Option<Sender<String>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, output_sender: Option<Sender<String>>) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner::default())),
            child: Arc::new(Mutex::new(None)),
            readers: Mutex::new(vec![]),
            output_sender,
        }
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>, SupervisorError> {
        self.inner.lock().map_err(|_| SupervisorError::Poisoned)
    }

    pub fn state(&self) -> SupervisorState {
        self.inner()
            .map(|inner| inner.state)
            .unwrap_or(SupervisorState::Crashed)
    }

    pub fn is_running(&self) -> bool {
        self.state() == SupervisorState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner().ok().and_then(|inner| inner.pid)
    }

    /// Exit status of the last worker, once it exited
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner().ok().and_then(|inner| inner.exit_status)
    }

    /// Spawn the worker and wait for its first heartbeat line
    pub fn start(&self, command: &WorkerCommand) -> Result<u32, SupervisorError> {
        {
            let mut inner = self.inner()?;
            if inner.state != SupervisorState::Stopped {
                return Err(SupervisorError::InvalidState {
                    state: inner.state,
                    action: "start",
                });
            }
            inner.state = SupervisorState::Starting;
            inner.pid = None;
            inner.exit_status = None;
            inner.stop_requested = false;
        }

        log::info!("Start {}", command.program.display());
        let mut child = match command.command().spawn() {
            Ok(child) => child,
            Err(error) => {
                self.inner()?.state = SupervisorState::Stopped;
                return Err(SupervisorError::Spawn(error));
            }
        };
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.inner()?.pid = Some(pid);
        *self.child.lock().map_err(|_| SupervisorError::Poisoned)? = Some(child);
        if self.inner()?.stop_requested {
            self.kill(pid);
            return Err(SupervisorError::Interrupted);
        }

        let (heartbeat_sender, heartbeat_receiver) = bounded(1);
        self.spawn_readers(stdout, stderr, heartbeat_sender)?;

        let heartbeat = heartbeat_receiver.recv_timeout(self.config.startup_timeout);
        let mut inner = self.inner()?;
        if inner.stop_requested {
            return Err(SupervisorError::Interrupted);
        }

        match heartbeat {
            Ok(()) => {
                // Process may already have exited after its first heartbeat
                if inner.state == SupervisorState::Starting {
                    inner.state = SupervisorState::Running;
                }
                log::info!("Monitoring process {} is running", pid);
                Ok(pid)
            }
            Err(RecvTimeoutError::Timeout) => {
                inner.state = SupervisorState::Crashed;
                drop(inner);
                log::error!(
                    "No heartbeat from process {} within {:?}, kill it",
                    pid,
                    self.config.startup_timeout
                );
                self.kill(pid);
                Err(SupervisorError::StartupTimeout(self.config.startup_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                // Even a successful exit is a failed startup without heartbeat
                inner.state = SupervisorState::Crashed;
                log::error!("Process {} exited during startup", pid);
                Err(SupervisorError::ExitedDuringStartup)
            }
        }
    }

    fn spawn_readers(
        &self,
        stdout: Option<impl Read + Send + 'static>,
        stderr: Option<impl Read + Send + 'static>,
        heartbeat_sender: Sender<()>,
    ) -> Result<(), SupervisorError> {
        let mut readers = self.readers.lock().map_err(|_| SupervisorError::Poisoned)?;
        readers.clear();

        if let Some(stdout) = stdout {
            let output_sender = self.output_sender.clone();
            let inner = self.inner.clone();
            let child = self.child.clone();
            let grace = self.config.stop_grace;
            readers.push(thread::spawn(move || {
                forward_lines(stdout, output_sender.as_ref(), Some(&heartbeat_sender));
                // End of stream means the process is exiting
                on_output_closed(&inner, &child, grace);
                drop(heartbeat_sender);
            }));
        }

        if let Some(stderr) = stderr {
            let output_sender = self.output_sender.clone();
            readers.push(thread::spawn(move || {
                forward_lines(stderr, output_sender.as_ref(), None);
            }));
        }

        Ok(())
    }

    /// Stop the worker: terminate, wait `stop_grace`, then force kill
    pub fn stop(&self) -> Result<(), SupervisorError> {
        let pid = {
            let mut inner = self.inner()?;
            match inner.state {
                SupervisorState::Stopped => return Ok(()),
                SupervisorState::Running | SupervisorState::Starting => {}
                state => {
                    return Err(SupervisorError::InvalidState {
                        state,
                        action: "stop",
                    })
                }
            }
            inner.state = SupervisorState::Stopping;
            inner.stop_requested = true;
            inner.pid
        };

        if let Some(pid) = pid {
            log::info!("Stop monitoring process {}", pid);
            let stopped = self.terminate(pid)?;
            if !stopped {
                log::warn!(
                    "Process {} didn't stop within {:?}, force kill it",
                    pid,
                    self.config.stop_grace
                );
                self.kill(pid);
            }

            if let Some(liveness_file) = &self.config.liveness_file {
                if let Err(error) = LivenessFile::new(liveness_file.clone()).remove_if_owned_by(pid)
                {
                    log::error!("{}", error);
                }
            }
        }

        self.join_readers();
        let mut inner = self.inner()?;
        inner.state = SupervisorState::Stopped;
        log::info!("Monitoring process stopped");
        Ok(())
    }

    /// Operator acknowledged a crash: a new start is allowed
    pub fn acknowledge(&self) -> Result<(), SupervisorError> {
        let mut inner = self.inner()?;
        match inner.state {
            SupervisorState::Crashed => {
                inner.state = SupervisorState::Stopped;
                Ok(())
            }
            state => Err(SupervisorError::InvalidState {
                state,
                action: "acknowledge",
            }),
        }
    }

    /// Ask process group to terminate and wait for exit. Return false if still
    /// alive after grace period.
    fn terminate(&self, pid: u32) -> Result<bool, SupervisorError> {
        signal_terminate(pid)?;
        let until = Instant::now() + self.config.stop_grace;
        loop {
            if self.try_reap()? {
                return Ok(true);
            }
            if Instant::now() >= until {
                return Ok(false);
            }
            thread::sleep(EXIT_POLL);
        }
    }

    fn kill(&self, pid: u32) {
        signal_kill(pid);
        match self.child.lock() {
            Ok(mut child) => {
                if let Some(mut child_) = child.take() {
                    if let Err(error) = child_.kill() {
                        log::debug!("Kill process {}: {}", pid, error);
                    }
                    match child_.wait() {
                        Ok(status) => self.record_exit(status),
                        Err(error) => log::error!("Wait process {}: {}", pid, error),
                    }
                }
            }
            Err(_) => log::error!("Supervisor lock poisoned while killing {}", pid),
        }
    }

    /// True if process exited (or was already reaped)
    fn try_reap(&self) -> Result<bool, SupervisorError> {
        let mut child = self.child.lock().map_err(|_| SupervisorError::Poisoned)?;
        let status = match child.as_mut() {
            None => return Ok(true),
            Some(child_) => child_.try_wait().map_err(SupervisorError::Spawn)?,
        };
        match status {
            Some(status) => {
                child.take();
                drop(child);
                self.record_exit(status);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record_exit(&self, status: ExitStatus) {
        if let Ok(mut inner) = self.inner() {
            inner.exit_status = Some(status);
        }
    }

    fn join_readers(&self) {
        if let Ok(mut readers) = self.readers.lock() {
            for reader in readers.drain(..) {
                if reader.join().is_err() {
                    log::error!("Output reader panicked");
                }
            }
        }
    }
}

/// Forward each line to `output_sender`. Partial lines are kept until their
/// newline; the last one is flushed at end of stream.
fn forward_lines<R: Read>(
    stream: R,
    output_sender: Option<&Sender<String>>,
    heartbeat_sender: Option<&Sender<()>>,
) {
    let mut reader = BufReader::new(stream);
    let mut buffer = vec![];

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer)
                    .trim_end_matches(&['\r', '\n'][..])
                    .to_string();
                if let Some(heartbeat_sender) = heartbeat_sender {
                    if line.contains(HEARTBEAT_MARKER) {
                        // Only first one matter
                        let _ = heartbeat_sender.try_send(());
                    }
                }
                if let Some(output_sender) = output_sender {
                    if output_sender.send(line).is_err() {
                        log::debug!("Output receiver is gone");
                    }
                }
            }
            Err(error) => {
                log::error!("Error reading process output: {}", error);
                break;
            }
        }
    }
}

/// Worker output closed: it is exiting. If nobody asked it to stop, its exit is
/// a crash (unless it exited successfully).
fn on_output_closed(
    inner: &Arc<Mutex<Inner>>,
    child: &Arc<Mutex<Option<Child>>>,
    grace: Duration,
) {
    match inner.lock() {
        Ok(inner_) => match inner_.state {
            SupervisorState::Running | SupervisorState::Starting => {}
            _ => return,
        },
        Err(_) => return,
    }

    let status = match child.lock() {
        Ok(mut child) => match child.take() {
            Some(mut child_) => wait_exit(&mut child_, grace),
            None => None,
        },
        Err(_) => None,
    };

    if let Ok(mut inner_) = inner.lock() {
        // Stop may have been requested meanwhile
        if !matches!(
            inner_.state,
            SupervisorState::Running | SupervisorState::Starting
        ) {
            return;
        }
        inner_.exit_status = status;
        match status {
            Some(status) if status.success() => {
                log::info!("Monitoring process exited");
                inner_.state = SupervisorState::Stopped;
            }
            _ => {
                log::error!("Monitoring process crashed ({:?})", status);
                inner_.state = SupervisorState::Crashed;
            }
        }
    }
}

fn wait_exit(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let until = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < until => thread::sleep(EXIT_POLL),
            Ok(None) => {
                // Output closed but process hang
                signal_kill(child.id());
                let _ = child.kill();
                return child.wait().ok();
            }
            Err(error) => {
                log::error!("Wait process {}: {}", child.id(), error);
                return None;
            }
        }
    }
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> Result<(), SupervisorError> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(error) => Err(SupervisorError::Signal(pid, error.to_string())),
    }
}

#[cfg(unix)]
fn signal_kill(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(error) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        log::debug!("Kill process group {}: {}", pid, error);
    }
}

#[cfg(windows)]
fn signal_terminate(pid: u32) -> Result<(), SupervisorError> {
    let pid_ = pid.to_string();
    Command::new("taskkill")
        .args(["/T", "/PID", pid_.as_str()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|_| ())
        .map_err(|error| SupervisorError::Signal(pid, error.to_string()))
}

#[cfg(windows)]
fn signal_kill(pid: u32) {
    let pid_ = pid.to_string();
    if let Err(error) = Command::new("taskkill")
        .args(["/F", "/T", "/PID", pid_.as_str()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        log::debug!("Kill process {}: {}", pid, error);
    }
}

/// Stop a worker started by another control surface, found by its liveness
/// file. Return false if no worker was running.
pub fn stop_detached(liveness: &LivenessFile, grace: Duration) -> Result<bool, SupervisorError> {
    let pid = match liveness.running_pid() {
        Some(pid) => pid,
        None => {
            if let Err(error) = liveness.remove() {
                log::warn!("{}", error);
            }
            return Ok(false);
        }
    };

    log::info!("Stop monitoring process {}", pid);
    signal_terminate(pid)?;
    let until = Instant::now() + grace;
    while is_process_alive(pid) && Instant::now() < until {
        thread::sleep(EXIT_POLL);
    }
    if is_process_alive(pid) {
        log::warn!("Process {} didn't stop within {:?}, force kill it", pid, grace);
        signal_kill(pid);
    }

    if let Err(error) = liveness.remove_if_owned_by(pid) {
        log::error!("{}", error);
    }
    Ok(true)
}
