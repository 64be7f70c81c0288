use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::error::LivenessError;

/// Plain text file containing the worker process identifier. A file pointing
/// to a dead process is considered as "not running".
#[derive(Debug, Clone)]
pub struct LivenessFile {
    path: PathBuf,
}

impl LivenessFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_current(&self) -> Result<(), LivenessError> {
        self.write(std::process::id())
    }

    pub fn write(&self, pid: u32) -> Result<(), LivenessError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| LivenessError::Write(self.path.clone(), error))?;
        }
        fs::write(&self.path, pid.to_string())
            .map_err(|error| LivenessError::Write(self.path.clone(), error))
    }

    /// Pid written in the file, `None` if there is no file or if it can't be parsed
    pub fn read_pid(&self) -> Result<Option<u32>, LivenessError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(raw.trim().parse::<u32>().ok()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(LivenessError::Read(self.path.clone(), error)),
        }
    }

    pub fn remove(&self) -> Result<(), LivenessError> {
        match fs::remove_file(&self.path) {
            Ok(_) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(LivenessError::Remove(self.path.clone(), error)),
        }
    }

    /// Remove the file only if it still reference given pid (another worker
    /// may have been started since)
    pub fn remove_if_owned_by(&self, pid: u32) -> Result<(), LivenessError> {
        if self.read_pid()? == Some(pid) {
            self.remove()?;
        }
        Ok(())
    }

    /// Pid of the running worker. Stale or unreadable file give `None`.
    pub fn running_pid(&self) -> Option<u32> {
        match self.read_pid() {
            Ok(Some(pid)) if is_process_alive(pid) => Some(pid),
            Ok(Some(pid)) => {
                log::debug!("Liveness file reference dead process {}", pid);
                None
            }
            Ok(None) => None,
            Err(error) => {
                log::warn!("{}", error);
                None
            }
        }
    }
}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    // No signal sent, only existence is checked
    match kill(Pid::from_raw(pid as i32), None::<Signal>) {
        Ok(_) => true,
        Err(Errno::ESRCH) => false,
        // Exist but owned by someone else
        Err(_) => true,
    }
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    let filter = format!("PID eq {}", pid);
    match std::process::Command::new("tasklist")
        .args(["/FI", filter.as_str(), "/NH"])
        .output()
    {
        Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()),
        Err(error) => {
            log::warn!("Unable to run tasklist: {}", error);
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn liveness_file() -> LivenessFile {
        let folder = testdir::testdir!().join(uuid::Uuid::new_v4().to_string());
        LivenessFile::new(folder.join("monitor.pid"))
    }

    #[test]
    fn test_write_read_remove() {
        let file = liveness_file();

        file.write_current().unwrap();
        assert_eq!(file.read_pid().unwrap(), Some(std::process::id()));
        assert_eq!(file.running_pid(), Some(std::process::id()));

        file.remove().unwrap();
        assert_eq!(file.read_pid().unwrap(), None);
        assert_eq!(file.running_pid(), None);
        // Removing twice is fine
        file.remove().unwrap();
    }

    #[test]
    fn test_garbage_is_not_running() {
        let file = liveness_file();
        fs::create_dir_all(file.path().parent().unwrap()).unwrap();
        fs::write(file.path(), "not a pid").unwrap();

        assert_eq!(file.read_pid().unwrap(), None);
        assert_eq!(file.running_pid(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_pid_is_not_running() {
        let file = liveness_file();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        file.write(pid).unwrap();

        assert_eq!(file.running_pid(), None);
    }

    #[test]
    fn test_remove_if_owned_by() {
        let file = liveness_file();
        file.write(42).unwrap();

        file.remove_if_owned_by(43).unwrap();
        assert_eq!(file.read_pid().unwrap(), Some(42));

        file.remove_if_owned_by(42).unwrap();
        assert_eq!(file.read_pid().unwrap(), None);
    }
}
