use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use hikibridge_core::{cancel::CancellationToken, types::ChangeEvent};
use rand::Rng;

use crate::{
    client::{IngestClient, Payload},
    error::DeliveryError,
    queue::IngestionQueue,
    snapshot::{DeadLetter, SnapshotStore},
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (starting at 1),
    /// without jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    /// `delay` plus a random part in `[0, delay / 2]`
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let max_jitter = (delay / 2).as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=max_jitter);
        delay + Duration::from_millis(jitter)
    }
}

/// In flight delivery state. Never persisted: after a restart the event is
/// found again by the scanner.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub event: ChangeEvent,
    pub attempt_count: u32,
    pub next_retry_at: Instant,
}

impl DeliveryAttempt {
    pub fn new(event: ChangeEvent) -> Self {
        Self {
            event,
            attempt_count: 0,
            next_retry_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Delivered and committed at given generation
    Delivered(u64),
    DeadLettered,
    /// Drain deadline reached while waiting for a retry
    Abandoned,
}

pub struct DeliveryWorker {
    client: Box<dyn IngestClient + Send>,
    store: Box<dyn SnapshotStore + Send>,
    queue: IngestionQueue,
    cancel: CancellationToken,
    policy: RetryPolicy,
}

impl DeliveryWorker {
    pub fn new(
        client: Box<dyn IngestClient + Send>,
        store: Box<dyn SnapshotStore + Send>,
        queue: IngestionQueue,
        cancel: CancellationToken,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            store,
            queue,
            cancel,
            policy,
        }
    }

    pub fn store(&self) -> &dyn SnapshotStore {
        self.store.as_ref()
    }

    /// Consume the queue until cancelled and drained, or until drain deadline
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_expired() {
                if !self.queue.is_empty() {
                    log::warn!(
                        "Drain grace elapsed, {} event(s) left for next scan",
                        self.queue.len()
                    );
                }
                break;
            }

            let event = match self.queue.peek(|| self.cancel.is_cancelled())? {
                Some(event) => event,
                None => break,
            };

            match self.deliver(event)? {
                Outcome::Abandoned => break,
                Outcome::Delivered(_) | Outcome::DeadLettered => {
                    self.queue.ack()?;
                }
            }
        }

        log::info!("Delivery stopped");
        Ok(())
    }

    pub fn deliver(&mut self, event: ChangeEvent) -> Result<Outcome> {
        let payload = Payload::from(&event);
        let mut attempt = DeliveryAttempt::new(event);

        loop {
            attempt.attempt_count += 1;
            log::debug!(
                "Send {} (attempt {}/{})",
                attempt.event,
                attempt.attempt_count,
                self.policy.max_attempts
            );

            match self.client.send(&payload) {
                Ok(()) => {
                    let generation = self
                        .store
                        .commit(&attempt.event)
                        .context(format!("Commit delivered {}", attempt.event))?;
                    log::info!("Delivered {} (generation {})", attempt.event, generation);
                    return Ok(Outcome::Delivered(generation));
                }
                Err(DeliveryError::Transient(message))
                    if attempt.attempt_count < self.policy.max_attempts =>
                {
                    let delay = self.policy.jittered_delay(attempt.attempt_count);
                    attempt.next_retry_at = Instant::now() + delay;
                    log::warn!(
                        "Delivery of {} failed ({}), retry in {:?}",
                        attempt.event,
                        message,
                        delay
                    );
                    let waited = self
                        .cancel
                        .sleep_unless(delay, |cancel| cancel.is_expired());
                    if !waited {
                        log::warn!("Give up {} before its retry, stopping", attempt.event);
                        return Ok(Outcome::Abandoned);
                    }
                }
                Err(error) => {
                    log::error!(
                        "Delivery of {} failed after {} attempt(s): {}",
                        attempt.event,
                        attempt.attempt_count,
                        error
                    );
                    self.store
                        .dead_letter(&DeadLetter::new(
                            &attempt.event,
                            attempt.attempt_count,
                            error.to_string(),
                        ))
                        .context(format!("Write dead letter for {}", attempt.event))?;
                    return Ok(Outcome::DeadLettered);
                }
            }
        }
    }
}
