use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Shared stop request. Once cancelled, producers must stop producing; consumers
/// may continue until the drain deadline is reached.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    stop_signal: Arc<AtomicBool>,
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and leave `grace` to consumers for draining
    pub fn cancel(&self, grace: Duration) {
        if let Ok(mut deadline) = self.deadline.lock() {
            if deadline.is_none() {
                *deadline = Some(Instant::now() + grace);
            }
        }
        self.stop_signal.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop_signal.load(Ordering::Relaxed)
    }

    /// True when cancelled and drain deadline is passed
    pub fn is_expired(&self) -> bool {
        if !self.is_cancelled() {
            return false;
        }
        match self.deadline.lock() {
            Ok(deadline) => deadline.map(|d| Instant::now() >= d).unwrap_or(true),
            Err(_) => true,
        }
    }

    pub fn stop_signal(&self) -> &Arc<AtomicBool> {
        &self.stop_signal
    }

    /// Sleep `duration` by small slices. Return false if `interrupted` became
    /// true before the end.
    pub fn sleep_unless<F>(&self, duration: Duration, interrupted: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        let until = Instant::now() + duration;
        loop {
            if interrupted(self) {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(until - now));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cancel_then_expire() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(!token.is_expired());

        token.cancel(Duration::from_millis(100));
        assert!(token.is_cancelled());
        assert!(!token.is_expired());

        thread::sleep(Duration::from_millis(150));
        assert!(token.is_expired());
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();

        clone.cancel(Duration::ZERO);

        assert!(token.is_cancelled());
        assert!(token.is_expired());
    }

    #[test]
    fn test_sleep_interrupted() {
        let token = CancellationToken::new();
        let clone = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            clone.cancel(Duration::ZERO);
        });

        let started = Instant::now();
        let completed = token.sleep_unless(Duration::from_secs(10), |t| t.is_cancelled());

        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
