use std::{
    env, fs, io,
    path::{Path, PathBuf},
    process::Command,
};

use hikibridge_core::APP_NAME;

use crate::error::AutostartError;

const DESKTOP_ENTRY_FILE_NAME: &str = "hikibridge.desktop";
const RUN_KEY: &str = r"HKCU\Software\Microsoft\Windows\CurrentVersion\Run";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Registered with the expected command
    Configured(String),
    NotRegistered,
    Mismatch { expected: String, found: String },
}

impl Verification {
    fn compare(expected: &str, found: Option<String>) -> Self {
        match found {
            None => Self::NotRegistered,
            Some(found) if found == expected => Self::Configured(found),
            Some(found) => Self::Mismatch {
                expected: expected.to_string(),
                found,
            },
        }
    }
}

/// Operating system "run at login" registration
pub trait Autostart {
    fn enable(&self) -> Result<(), AutostartError>;
    fn disable(&self) -> Result<(), AutostartError>;
    fn is_enabled(&self) -> Result<bool, AutostartError>;
    fn verify(&self) -> Result<Verification, AutostartError>;
}

/// Command registered for login: this executable with the `launch` subcommand
pub fn launch_command() -> io::Result<String> {
    let executable = env::current_exe()?;
    Ok(format!("\"{}\" launch", executable.display()))
}

/// XDG autostart desktop entry (Linux and BSD desktops)
pub struct DesktopEntryAutostart {
    path: PathBuf,
    command: String,
}

impl DesktopEntryAutostart {
    pub fn new(path: PathBuf, command: String) -> Self {
        Self { path, command }
    }

    pub fn from_env(command: String) -> Result<Self, AutostartError> {
        let config_folder = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .ok_or(AutostartError::UnableToFindHomeUser)?;
        Ok(Self::new(
            config_folder.join("autostart").join(DESKTOP_ENTRY_FILE_NAME),
            command,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entry(&self) -> String {
        format!(
            "[Desktop Entry]\nName={}\nExec={}\nType=Application\nX-GNOME-Autostart-enabled=true\n",
            APP_NAME, self.command
        )
    }

    fn registered_command(&self) -> Result<Option<String>, AutostartError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(AutostartError::Read(self.path.clone(), error)),
        };

        Ok(raw
            .lines()
            .find_map(|line| line.strip_prefix("Exec="))
            .map(|command| command.trim().to_string()))
    }
}

impl Autostart for DesktopEntryAutostart {
    fn enable(&self) -> Result<(), AutostartError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| AutostartError::Write(parent.to_path_buf(), error))?;
        }
        fs::write(&self.path, self.entry())
            .map_err(|error| AutostartError::Write(self.path.clone(), error))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o755))
                .map_err(|error| AutostartError::Write(self.path.clone(), error))?;
        }

        log::info!("Added to startup ({})", self.path.display());
        Ok(())
    }

    fn disable(&self) -> Result<(), AutostartError> {
        match fs::remove_file(&self.path) {
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(AutostartError::Remove(self.path.clone(), error)),
        }
        log::info!("Removed from startup");
        Ok(())
    }

    fn is_enabled(&self) -> Result<bool, AutostartError> {
        Ok(self.path.exists())
    }

    fn verify(&self) -> Result<Verification, AutostartError> {
        Ok(Verification::compare(
            self.command.as_str(),
            self.registered_command()?,
        ))
    }
}

/// Value of the current user `Run` registry key, managed with `reg.exe`
pub struct RunKeyAutostart {
    command: String,
}

impl RunKeyAutostart {
    pub fn new(command: String) -> Self {
        Self { command }
    }

    fn reg(&self, args: &[&str]) -> Result<String, AutostartError> {
        let output = Command::new("reg")
            .args(args)
            .output()
            .map_err(|error| AutostartError::Registry(format!("Unable to run reg: {}", error)))?;

        if !output.status.success() {
            return Err(AutostartError::Registry(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn registered_command(&self) -> Result<Option<String>, AutostartError> {
        // reg query fail when value doesn't exist
        match self.reg(&["query", RUN_KEY, "/v", APP_NAME]) {
            Ok(output) => Ok(parse_reg_query(&output, APP_NAME)),
            Err(_) => Ok(None),
        }
    }
}

/// Extract data of `name` from `reg query` output, like
/// `    HikiBridge    REG_SZ    "C:\hikibridge.exe" launch`
fn parse_reg_query(output: &str, name: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let line = line.trim();
        let rest = line.strip_prefix(name)?.trim_start();
        let data = rest.strip_prefix("REG_SZ")?;
        Some(data.trim().to_string())
    })
}

impl Autostart for RunKeyAutostart {
    fn enable(&self) -> Result<(), AutostartError> {
        self.reg(&[
            "add",
            RUN_KEY,
            "/v",
            APP_NAME,
            "/t",
            "REG_SZ",
            "/d",
            self.command.as_str(),
            "/f",
        ])?;
        log::info!("Added to Windows startup");
        Ok(())
    }

    fn disable(&self) -> Result<(), AutostartError> {
        if self.registered_command()?.is_some() {
            self.reg(&["delete", RUN_KEY, "/v", APP_NAME, "/f"])?;
        }
        log::info!("Removed from Windows startup");
        Ok(())
    }

    fn is_enabled(&self) -> Result<bool, AutostartError> {
        Ok(self.registered_command()?.is_some())
    }

    fn verify(&self) -> Result<Verification, AutostartError> {
        Ok(Verification::compare(
            self.command.as_str(),
            self.registered_command()?,
        ))
    }
}

pub struct UnsupportedAutostart;

impl Autostart for UnsupportedAutostart {
    fn enable(&self) -> Result<(), AutostartError> {
        Err(AutostartError::Unsupported(env::consts::OS))
    }

    fn disable(&self) -> Result<(), AutostartError> {
        Err(AutostartError::Unsupported(env::consts::OS))
    }

    fn is_enabled(&self) -> Result<bool, AutostartError> {
        Err(AutostartError::Unsupported(env::consts::OS))
    }

    fn verify(&self) -> Result<Verification, AutostartError> {
        Err(AutostartError::Unsupported(env::consts::OS))
    }
}

pub fn platform_autostart(command: String) -> Result<Box<dyn Autostart>, AutostartError> {
    if cfg!(windows) {
        Ok(Box::new(RunKeyAutostart::new(command)))
    } else if cfg!(any(
        target_os = "linux",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    )) {
        Ok(Box::new(DesktopEntryAutostart::from_env(command)?))
    } else {
        Ok(Box::new(UnsupportedAutostart))
    }
}
