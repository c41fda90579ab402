//! Process-wide circuit breakers for external identification providers.
//!
//! One breaker per provider (AcoustID, AudD, the metadata directory), shared
//! across every station worker: a provider having a bad minute should stop
//! every worker from hammering it, not just the one that noticed first.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

const ERROR_THRESHOLD: u32 = 10;
const ERROR_WINDOW: Duration = Duration::from_secs(60);
const OPEN_DURATION: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls are allowed through.
    Closed,
    /// Calls are rejected until `OPEN_DURATION` has elapsed since opening.
    Open,
    /// `OPEN_DURATION` has elapsed; the next call is allowed through as a
    /// probe. Success closes the breaker, failure re-opens it.
    HalfOpen,
}

struct Breaker {
    error_times: Vec<Instant>,
    opened_at: Option<Instant>,
    probing: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            error_times: Vec::new(),
            opened_at: None,
            probing: false,
        }
    }

    fn state(&mut self, now: Instant) -> BreakerState {
        match self.opened_at {
            None => BreakerState::Closed,
            Some(opened_at) => {
                if now.duration_since(opened_at) >= OPEN_DURATION {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
        }
    }

    fn record_error(&mut self, now: Instant) {
        self.error_times.retain(|&t| now.duration_since(t) < ERROR_WINDOW);
        self.error_times.push(now);
        if self.probing {
            self.probing = false;
            self.opened_at = Some(now);
            self.error_times.clear();
            self.error_times.push(now);
            return;
        }
        if self.error_times.len() as u32 >= ERROR_THRESHOLD && self.opened_at.is_none() {
            self.opened_at = Some(now);
        }
    }

    fn record_success(&mut self) {
        if self.probing {
            self.probing = false;
            self.opened_at = None;
            self.error_times.clear();
        }
    }
}

/// Registry of breakers, one per provider name, guarded by a single mutex.
///
/// Contention is negligible: calls happen at most once per chunk per station,
/// and a provider name lookup plus a handful of `Instant` comparisons is
/// microseconds of work under the lock.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakerRegistry {
    fn new() -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a call to `provider` is currently allowed. A half-open breaker
    /// allows exactly one caller through as a probe; subsequent callers are
    /// rejected until that probe reports success or failure.
    pub fn allow(&self, provider: &str) -> bool {
        let now = Instant::now();
        let mut breakers = self.breakers.lock().expect("circuit breaker lock poisoned");
        let breaker = breakers.entry(provider.to_string()).or_insert_with(Breaker::new);
        match breaker.state(now) {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if breaker.probing {
                    false
                } else {
                    breaker.probing = true;
                    true
                }
            }
        }
    }

    /// Record a failed call to `provider` (timeout, 5xx, connection reset).
    pub fn record_error(&self, provider: &str) {
        let now = Instant::now();
        let mut breakers = self.breakers.lock().expect("circuit breaker lock poisoned");
        breakers.entry(provider.to_string()).or_insert_with(Breaker::new).record_error(now);
    }

    /// Record a successful call to `provider`, closing a half-open breaker.
    pub fn record_success(&self, provider: &str) {
        let mut breakers = self.breakers.lock().expect("circuit breaker lock poisoned");
        if let Some(breaker) = breakers.get_mut(provider) {
            breaker.record_success();
        }
    }

    /// Current state, for health reporting. Returns `Closed` for a provider
    /// that has never recorded an error.
    pub fn state(&self, provider: &str) -> BreakerState {
        let now = Instant::now();
        let mut breakers = self.breakers.lock().expect("circuit breaker lock poisoned");
        breakers.entry(provider.to_string()).or_insert_with(Breaker::new).state(now)
    }
}

/// The process-wide registry. External API clients should go through this
/// rather than keeping their own per-instance breaker, since the contract is
/// "one breaker per provider across the whole process."
pub static CIRCUIT_BREAKERS: Lazy<CircuitBreakerRegistry> = Lazy::new(CircuitBreakerRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let registry = CircuitBreakerRegistry::new();
        assert!(registry.allow("test-provider-a"));
        assert_eq!(registry.state("test-provider-a"), BreakerState::Closed);
    }

    #[test]
    fn opens_after_threshold_errors_in_window() {
        let registry = CircuitBreakerRegistry::new();
        for _ in 0..ERROR_THRESHOLD {
            registry.record_error("test-provider-b");
        }
        assert_eq!(registry.state("test-provider-b"), BreakerState::Open);
        assert!(!registry.allow("test-provider-b"));
    }

    #[test]
    fn stays_closed_below_threshold() {
        let registry = CircuitBreakerRegistry::new();
        for _ in 0..ERROR_THRESHOLD - 1 {
            registry.record_error("test-provider-c");
        }
        assert_eq!(registry.state("test-provider-c"), BreakerState::Closed);
    }

    #[test]
    fn breakers_are_independent_per_provider() {
        let registry = CircuitBreakerRegistry::new();
        for _ in 0..ERROR_THRESHOLD {
            registry.record_error("test-provider-d");
        }
        assert_eq!(registry.state("test-provider-d"), BreakerState::Open);
        assert_eq!(registry.state("test-provider-e"), BreakerState::Closed);
    }
}
