use std::{
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use hikibridge_core::{cancel::CancellationToken, liveness::LivenessFile};

use crate::{
    client::IngestClient,
    context::Context as WorkerContext,
    database::connection,
    delivery::DeliveryWorker,
    heartbeat::{self, HEARTBEAT_PERIOD},
    queue::{IngestionQueue, QueueError},
    scan::Scanner,
    snapshot::{DiskSnapshotStore, SnapshotStore},
    watch::WakeWatcher,
};

const WAKE_POLL: Duration = Duration::from_millis(250);

struct Runner {
    context: WorkerContext,
    cancel: CancellationToken,
    client: Option<Box<dyn IngestClient + Send>>,
    queue: IngestionQueue,
    wake_sender: Sender<()>,
    wake_receiver: Receiver<()>,
}

impl Runner {
    fn new(
        context: WorkerContext,
        cancel: CancellationToken,
        client: Box<dyn IngestClient + Send>,
    ) -> Self {
        let queue = IngestionQueue::new(context.queue_capacity);
        let (wake_sender, wake_receiver) = bounded(1);

        Self {
            context,
            cancel,
            client: Some(client),
            queue,
            wake_sender,
            wake_receiver,
        }
    }

    fn store(&self) -> Result<DiskSnapshotStore> {
        Ok(DiskSnapshotStore::new(
            connection(&self.context.database_path).context(format!(
                "Open snapshot database '{}'",
                self.context.database_path.display()
            ))?,
        ))
    }

    fn ensure_db(&self) -> Result<()> {
        self.store()?
            .create_tables()
            .context("Create snapshot tables")
    }

    fn heartbeat(&self) -> JoinHandle<()> {
        let heartbeat_cancel = self.cancel.clone();

        thread::spawn(move || {
            heartbeat::beat(&heartbeat_cancel, HEARTBEAT_PERIOD);
        })
    }

    fn wake_watcher(&self) -> JoinHandle<()> {
        let wake_watcher = WakeWatcher::new(
            self.context.folder_path.clone(),
            self.cancel.clone(),
            self.wake_sender.clone(),
        );

        thread::spawn(move || {
            // Without notifications, scanner still run at each interval
            if let Err(error) = wake_watcher.listen() {
                log::warn!("Filesystem notifications unavailable: {:#}", error);
            }
        })
    }

    fn delivery(&mut self) -> Result<JoinHandle<Result<()>>> {
        let client = match self.client.take() {
            Some(client) => client,
            None => bail!("Delivery already started"),
        };
        let store = self.store()?;
        let queue = self.queue.clone();
        let cancel = self.cancel.clone();
        let policy = self.context.retry_policy();

        Ok(thread::spawn(move || {
            let mut delivery =
                DeliveryWorker::new(client, Box::new(store), queue, cancel.clone(), policy);
            let result = delivery.run();
            if result.is_err() {
                // Scanner would wait forever for a drain
                cancel.cancel(Duration::ZERO);
            }
            result
        }))
    }

    fn scan_loop(&self) -> Result<()> {
        let store = self.store()?;
        let scanner = Scanner::new(self.context.folder_path.clone());

        loop {
            let snapshot = store.load().context("Load committed snapshot")?;
            let result = scanner.scan(&snapshot)?;
            if !result.events.is_empty() {
                log::info!(
                    "Found {} change(s) since generation {}",
                    result.events.len(),
                    snapshot.generation
                );
            }

            for event in result.events {
                match self.queue.push(event, &self.cancel) {
                    Ok(()) => {}
                    Err(QueueError::Cancelled) => return Ok(()),
                    Err(error) => return Err(error.into()),
                }
            }

            match self.queue.wait_drained(&self.cancel) {
                Ok(()) => {}
                Err(QueueError::Cancelled) => return Ok(()),
                Err(error) => return Err(error.into()),
            }

            if self.context.exit_after_sync {
                log::info!("Synchronization done");
                return Ok(());
            }

            if !self.wait_next_scan() {
                return Ok(());
            }
        }
    }

    /// Wait scan interval or a notification. Return false when cancelled.
    fn wait_next_scan(&self) -> bool {
        let until = Instant::now() + self.context.scan_interval;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            match self.wake_receiver.recv_timeout(WAKE_POLL.min(until - now)) {
                Ok(()) => {
                    log::debug!("Woken up by filesystem notification");
                    return true;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
        }
    }

    fn run(&mut self) -> Result<()> {
        self.ensure_db()?;

        let heartbeat = self.heartbeat();
        let wake_watcher = if self.context.exit_after_sync {
            None
        } else {
            Some(self.wake_watcher())
        };
        let delivery = self.delivery()?;

        let scan_result = self.scan_loop();
        if let Err(error) = &scan_result {
            log::error!("Scanner stopped: {:#}", error);
            self.cancel.cancel(Duration::ZERO);
        } else {
            self.cancel.cancel(self.context.drain_grace);
        }

        let delivery_result = match delivery.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("Delivery thread panicked")),
        };
        if let Some(wake_watcher) = wake_watcher {
            if wake_watcher.join().is_err() {
                log::error!("Notification thread panicked");
            }
        }
        if heartbeat.join().is_err() {
            log::error!("Heartbeat thread panicked");
        }

        scan_result.context("Scan watch root")?;
        delivery_result.context("Deliver changes")?;
        Ok(())
    }
}

/// Run the worker until `cancel` is cancelled (or after one pass with
/// `exit_after_sync`). Liveness file exists for the whole run.
pub fn run_with_client(
    context: WorkerContext,
    cancel: CancellationToken,
    client: Box<dyn IngestClient + Send>,
) -> Result<()> {
    let liveness = LivenessFile::new(context.liveness_path.clone());
    liveness.write_current()?;

    let result = Runner::new(context, cancel, client).run();

    if let Err(error) = liveness.remove() {
        log::error!("{}", error);
    }
    result
}

pub fn run(context: WorkerContext, cancel: CancellationToken) -> Result<()> {
    let client = context.client().context("Create ingestion client")?;
    run_with_client(context, cancel, Box::new(client))
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, Mutex},
        thread,
    };

    use hikibridge_core::types::ChangeKind;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{client::MockIngestClient, tests::*};

    fn context(tmpdir: &std::path::Path) -> WorkerContext {
        let mut context = WorkerContext::new(
            tmpdir.join("watched"),
            "http://127.0.0.1:9/ingest".to_string(),
            "key".to_string(),
            tmpdir.join("state").join("snapshot.sqlite3"),
            tmpdir.join("state").join("monitor.pid"),
        );
        context.scan_interval = Duration::from_millis(50);
        context.backoff_base = Duration::from_millis(1);
        context.backoff_max = Duration::from_millis(2);
        context
    }

    #[test]
    fn test_exit_after_sync_deliver_and_commit() {
        let tmpdir_ = tmpdir();
        write_file(&tmpdir_.join("watched"), "a.txt", 100);
        write_file(&tmpdir_.join("watched"), "Folder/b.txt", 10);
        let mut context = context(&tmpdir_);
        context.exit_after_sync = true;
        let sent = Arc::new(Mutex::new(vec![]));
        let sent_ = sent.clone();
        let mut client = MockIngestClient::new();
        client.expect_send().times(2).returning(move |payload| {
            sent_
                .lock()
                .unwrap()
                .push((payload.kind, payload.path.clone()));
            Ok(())
        });

        run_with_client(context.clone(), CancellationToken::new(), Box::new(client)).unwrap();

        assert_eq!(
            *sent.lock().unwrap(),
            vec![
                (ChangeKind::Added, "Folder/b.txt".to_string()),
                (ChangeKind::Added, "a.txt".to_string())
            ]
        );
        let store = disk_store(&tmpdir_.join("state"));
        assert_eq!(store.load().unwrap().len(), 2);
        assert!(!context.liveness_path.exists());
    }

    #[test]
    fn test_missing_watch_root_is_fatal() {
        let tmpdir_ = tmpdir();
        let context = context(&tmpdir_);

        let result = run_with_client(
            context.clone(),
            CancellationToken::new(),
            Box::new(MockIngestClient::new()),
        );

        assert!(result.is_err());
        assert!(!context.liveness_path.exists());
    }

    #[test]
    fn test_continuous_run_until_cancel() {
        let tmpdir_ = tmpdir();
        let watched = tmpdir_.join("watched");
        std::fs::create_dir_all(&watched).unwrap();
        let context = context(&tmpdir_);
        let sent = Arc::new(Mutex::new(vec![]));
        let sent_ = sent.clone();
        let mut client = MockIngestClient::new();
        client.expect_send().returning(move |payload| {
            sent_
                .lock()
                .unwrap()
                .push((payload.kind, payload.path.clone()));
            Ok(())
        });
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let run_context = context.clone();
        let runner =
            thread::spawn(move || run_with_client(run_context, run_cancel, Box::new(client)));

        thread::sleep(Duration::from_millis(300));
        assert!(context.liveness_path.exists());
        // Moved in at once, so scanner never see a partially written file
        let prepared = write_file(&tmpdir_, "a.txt", 100);
        std::fs::rename(prepared, watched.join("a.txt")).unwrap();
        thread::sleep(Duration::from_millis(1000));
        std::fs::remove_file(watched.join("a.txt")).unwrap();
        thread::sleep(Duration::from_millis(1000));
        cancel.cancel(Duration::from_millis(500));
        runner.join().unwrap().unwrap();

        assert_eq!(
            *sent.lock().unwrap(),
            vec![
                (ChangeKind::Added, "a.txt".to_string()),
                (ChangeKind::Removed, "a.txt".to_string())
            ]
        );
        assert!(!context.liveness_path.exists());
        let store = disk_store(&tmpdir_.join("state"));
        assert!(store.load().unwrap().is_empty());
        assert_eq!(store.generation().unwrap(), 2);
    }
}
