use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Duration,
};

use hikibridge_core::{cancel::CancellationToken, types::ChangeEvent};
use thiserror::Error;

const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue wait cancelled")]
    Cancelled,
    #[error("Nothing to acknowledge")]
    NothingToAcknowledge,
    #[error("Queue lock poisoned")]
    Poisoned,
}

struct Inner {
    events: VecDeque<ChangeEvent>,
    capacity: usize,
}

/// Bounded FIFO of change events. Producer is blocked when full. Consumer
/// read the front event with `peek` and remove it with `ack` once delivered,
/// so an event is never lost between read and delivery.
#[derive(Clone)]
pub struct IngestionQueue {
    inner: Arc<Mutex<Inner>>,
    // Notified when an event is pushed
    not_empty: Arc<Condvar>,
    // Notified when an event is acknowledged
    not_full: Arc<Condvar>,
}

impl IngestionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                events: VecDeque::with_capacity(capacity.max(1)),
                capacity: capacity.max(1),
            })),
            not_empty: Arc::new(Condvar::new()),
            not_full: Arc::new(Condvar::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        self.inner.lock().map_err(|_| QueueError::Poisoned)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().map(|inner| inner.capacity).unwrap_or(0)
    }

    /// Block while queue is full. Fail only if `cancel` is cancelled while waiting.
    pub fn push(&self, event: ChangeEvent, cancel: &CancellationToken) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        while inner.events.len() >= inner.capacity {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            inner = self
                .not_full
                .wait_timeout(inner, WAIT_SLICE)
                .map_err(|_| QueueError::Poisoned)?
                .0;
        }
        inner.events.push_back(event);
        self.not_empty.notify_all();
        Ok(())
    }

    /// Wait for the front event and return a copy of it, without removing it.
    /// Return `Ok(None)` if `stop` became true while queue is empty.
    pub fn peek<F>(&self, stop: F) -> Result<Option<ChangeEvent>, QueueError>
    where
        F: Fn() -> bool,
    {
        let mut inner = self.lock()?;
        loop {
            if let Some(event) = inner.events.front() {
                return Ok(Some(event.clone()));
            }
            if stop() {
                return Ok(None);
            }
            inner = self
                .not_empty
                .wait_timeout(inner, WAIT_SLICE)
                .map_err(|_| QueueError::Poisoned)?
                .0;
        }
    }

    /// Remove the front event (previously given by `peek`)
    pub fn ack(&self) -> Result<ChangeEvent, QueueError> {
        let mut inner = self.lock()?;
        let event = inner
            .events
            .pop_front()
            .ok_or(QueueError::NothingToAcknowledge)?;
        self.not_full.notify_all();
        Ok(event)
    }

    /// Block until all pushed events have been acknowledged
    pub fn wait_drained(&self, cancel: &CancellationToken) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        while !inner.events.is_empty() {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            inner = self
                .not_full
                .wait_timeout(inner, WAIT_SLICE)
                .map_err(|_| QueueError::Poisoned)?
                .0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
        time::Instant,
    };

    use hikibridge_core::types::ChangeEvent;

    use super::*;
    use crate::tests::*;

    fn event(name: &str) -> ChangeEvent {
        ChangeEvent::added(record(name, 1, 1, "x"))
    }

    #[test]
    fn test_fifo_with_peek_and_ack() {
        let queue = IngestionQueue::new(4);
        let cancel = CancellationToken::new();
        queue.push(event("a.txt"), &cancel).unwrap();
        queue.push(event("b.txt"), &cancel).unwrap();

        // Peek don't remove
        assert_eq!(queue.peek(|| false).unwrap(), Some(event("a.txt")));
        assert_eq!(queue.peek(|| false).unwrap(), Some(event("a.txt")));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.ack().unwrap(), event("a.txt"));
        assert_eq!(queue.peek(|| false).unwrap(), Some(event("b.txt")));
        assert_eq!(queue.ack().unwrap(), event("b.txt"));
        assert_eq!(queue.ack(), Err(QueueError::NothingToAcknowledge));
    }

    #[test]
    fn test_peek_stop_on_empty_queue() {
        let queue = IngestionQueue::new(1);

        assert_eq!(queue.peek(|| true).unwrap(), None);
    }

    #[test]
    fn test_full_queue_block_producer_without_dropping() {
        let queue = IngestionQueue::new(2);
        let cancel = CancellationToken::new();
        queue.push(event("a.txt"), &cancel).unwrap();
        queue.push(event("b.txt"), &cancel).unwrap();

        let pushed = Arc::new(AtomicBool::new(false));
        let producer_queue = queue.clone();
        let producer_pushed = pushed.clone();
        let producer_cancel = cancel.clone();
        let producer = thread::spawn(move || {
            producer_queue
                .push(event("c.txt"), &producer_cancel)
                .unwrap();
            producer_pushed.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(300));
        assert!(!pushed.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 2);

        queue.ack().unwrap();
        producer.join().unwrap();
        assert!(pushed.load(Ordering::SeqCst));

        let mut received = vec![];
        while let Some(event) = queue.peek(|| true).unwrap() {
            received.push(event.path.to_string());
            queue.ack().unwrap();
        }
        assert_eq!(received, vec!["b.txt", "c.txt"]);
    }

    #[test]
    fn test_cancel_unblock_producer() {
        let queue = IngestionQueue::new(1);
        let cancel = CancellationToken::new();
        queue.push(event("a.txt"), &cancel).unwrap();

        let producer_queue = queue.clone();
        let producer_cancel = cancel.clone();
        let started = Instant::now();
        let producer =
            thread::spawn(move || producer_queue.push(event("b.txt"), &producer_cancel));
        thread::sleep(Duration::from_millis(100));
        cancel.cancel(Duration::ZERO);

        assert_eq!(producer.join().unwrap(), Err(QueueError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        // Already queued event is still there
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_wait_drained() {
        let queue = IngestionQueue::new(4);
        let cancel = CancellationToken::new();
        queue.push(event("a.txt"), &cancel).unwrap();
        queue.push(event("b.txt"), &cancel).unwrap();

        let consumer_queue = queue.clone();
        let consumer = thread::spawn(move || {
            while let Some(_) = consumer_queue.peek(|| true).unwrap() {
                thread::sleep(Duration::from_millis(20));
                consumer_queue.ack().unwrap();
            }
        });

        queue.wait_drained(&cancel).unwrap();
        assert!(queue.is_empty());
        consumer.join().unwrap();
    }
}
