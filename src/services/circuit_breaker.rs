//! Circuit breaker guarding outbound calls to the notification hub.
//!
//! Closed lets every call through and counts consecutive failures. Once the
//! threshold is reached the breaker opens and rejects calls until the timeout
//! elapses; the next call then runs as a probe (half-open) and decides whether
//! the breaker closes again or re-opens.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    failure_threshold: u32,
    timeout_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            failure_threshold: failure_threshold.max(1),
            timeout_duration: timeout,
        }
    }

    fn read_state(&self) -> CircuitState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: CircuitState) {
        match self.state.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn mark_opened(&self) {
        match self.opened_at.lock() {
            Ok(mut guard) => *guard = Some(Instant::now()),
            Err(poisoned) => *poisoned.into_inner() = Some(Instant::now()),
        }
    }

    fn open_elapsed(&self) -> Option<Duration> {
        let opened = match self.opened_at.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        opened.map(|at| at.elapsed())
    }

    /// Whether the next call may go out. Moves Open → HalfOpen once the timeout has passed.
    pub fn can_execute(&self) -> bool {
        match self.read_state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let ready = self
                    .open_elapsed()
                    .map_or(true, |elapsed| elapsed >= self.timeout_duration);
                if ready {
                    self.set_state(CircuitState::HalfOpen);
                    info!("Circuit breaker transitioning to HalfOpen state");
                }
                ready
            }
        }
    }

    pub fn record_success(&self) {
        let previous = self.read_state();
        self.failure_count.store(0, Ordering::Relaxed);
        if previous == CircuitState::HalfOpen {
            self.set_state(CircuitState::Closed);
            info!("Circuit breaker recovered - transitioning to Closed state");
        }
    }

    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        match self.read_state() {
            CircuitState::Closed if failures >= self.failure_threshold => {
                self.mark_opened();
                self.set_state(CircuitState::Open);
                error!(
                    "Circuit breaker OPENED - {} failures reached threshold {}",
                    failures, self.failure_threshold
                );
            }
            CircuitState::HalfOpen => {
                self.mark_opened();
                self.set_state(CircuitState::Open);
                warn!("Circuit breaker probe failed - returning to Open state");
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.read_state()
    }
}
