use std::{
    fs,
    path::{Path, PathBuf},
    sync::mpsc::{channel, RecvTimeoutError},
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, TrySendError};
use hikibridge_core::{cancel::CancellationToken, utils::ignored_path};
use notify::{watcher, DebouncedEvent, RecursiveMode, Watcher};

const DEBOUNCE_DELAY: Duration = Duration::from_millis(500);
const RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// Listen filesystem notifications to wake the scanner before its next
/// interval. Never produce change events itself: the scanner stays the only
/// source of truth.
pub struct WakeWatcher {
    watch_root: PathBuf,
    cancel: CancellationToken,
    wake_sender: Sender<()>,
}

impl WakeWatcher {
    pub fn new(watch_root: PathBuf, cancel: CancellationToken, wake_sender: Sender<()>) -> Self {
        Self {
            watch_root,
            cancel,
            wake_sender,
        }
    }

    pub fn listen(&self) -> Result<()> {
        let watch_root = fs::canonicalize(&self.watch_root)
            .context(format!("Canonicalize '{}'", self.watch_root.display()))?;
        let (inotify_sender, inotify_receiver) = channel();
        let mut inotify_watcher = watcher(inotify_sender, DEBOUNCE_DELAY)?;
        inotify_watcher.watch(&watch_root, RecursiveMode::Recursive)?;
        log::debug!("Start listening changes of {}", watch_root.display());

        loop {
            match inotify_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(event) => {
                    if self.is_relevant(&event, &watch_root) {
                        self.wake();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.cancel.is_cancelled() {
                        log::debug!("Finished listening changes (on stop signal)");
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    log::error!("Finished listening changes (on channel closed)");
                    break;
                }
            }
        }

        Ok(())
    }

    fn is_relevant(&self, event: &DebouncedEvent, watch_root: &Path) -> bool {
        log::debug!("Local event received: {:?}", event);

        let absolute_path = match event {
            DebouncedEvent::Create(absolute_path)
            | DebouncedEvent::Write(absolute_path)
            | DebouncedEvent::Remove(absolute_path)
            | DebouncedEvent::Chmod(absolute_path)
            | DebouncedEvent::Rename(absolute_path, _) => absolute_path,
            DebouncedEvent::Rescan => return true,
            DebouncedEvent::NoticeWrite(_) | DebouncedEvent::NoticeRemove(_) => return false,
            DebouncedEvent::Error(error, path) => {
                log::error!("Notification error {} on {:?}", error, path);
                return false;
            }
        };

        match absolute_path.strip_prefix(watch_root) {
            Ok(relative_path) => !ignored_path(relative_path),
            Err(_) => true,
        }
    }

    fn wake(&self) {
        // A pending wake up is enough, scanner will see all changes
        match self.wake_sender.try_send(()) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("Scanner is gone, ignore wake up")
            }
        }
    }
}
