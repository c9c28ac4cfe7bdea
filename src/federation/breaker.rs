//! Per-endpoint circuit breakers.
//!
//! closed: calls flow; failures inside the rolling window are counted and
//! reaching the threshold opens the breaker.
//! open: calls are rejected without I/O until the cooldown elapses.
//! half-open: exactly one trial is admitted. Success closes the breaker and
//! resets the cooldown; failure reopens it with the cooldown doubled, up to
//! the configured maximum.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{info, warn};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(30),
            base_cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerRejection {
    Open { retry_in: Duration },
    TrialInFlight,
}

#[derive(Debug)]
struct Entry {
    state: BreakerState,
    failures: u32,
    window_start: Instant,
    cooldown: Duration,
    open_until: Instant,
    trial_in_flight: bool,
}

impl Entry {
    fn new(config: &BreakerConfig, now: Instant) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            window_start: now,
            cooldown: config.base_cooldown,
            open_until: now,
            trial_in_flight: false,
        }
    }
}

pub struct BreakerTable {
    config: BreakerConfig,
    entries: Mutex<HashMap<String, Entry>>,
}

impl BreakerTable {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // Entries are plain data; a panic mid-update leaves them usable.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self, endpoint: &str) -> BreakerState {
        self.entries()
            .get(endpoint)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Current cooldown applied when the endpoint next opens or reopens.
    pub fn cooldown(&self, endpoint: &str) -> Duration {
        self.entries()
            .get(endpoint)
            .map(|e| e.cooldown)
            .unwrap_or(self.config.base_cooldown)
    }

    /// Ask to call `endpoint`. The permit must be settled with
    /// [`BreakerPermit::success`] or [`BreakerPermit::failure`]; dropping it
    /// unsettled releases a half-open trial without recording an outcome.
    pub fn try_acquire(
        self: &Arc<Self>,
        endpoint: &str,
    ) -> Result<BreakerPermit, BreakerRejection> {
        let now = Instant::now();
        let mut entries = self.entries();
        let entry = entries
            .entry(endpoint.to_string())
            .or_insert_with(|| Entry::new(&self.config, now));

        let trial = match entry.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                if now < entry.open_until {
                    return Err(BreakerRejection::Open {
                        retry_in: entry.open_until - now,
                    });
                }
                info!("Circuit half-open for {}, admitting trial", endpoint);
                entry.state = BreakerState::HalfOpen;
                entry.trial_in_flight = true;
                true
            }
            BreakerState::HalfOpen => {
                if entry.trial_in_flight {
                    return Err(BreakerRejection::TrialInFlight);
                }
                entry.trial_in_flight = true;
                true
            }
        };

        Ok(BreakerPermit {
            table: Arc::clone(self),
            endpoint: endpoint.to_string(),
            trial,
            settled: false,
        })
    }

    fn record_success(&self, endpoint: &str) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(endpoint) else {
            return;
        };
        match entry.state {
            BreakerState::HalfOpen => {
                info!("Circuit closed for {}", endpoint);
                entry.state = BreakerState::Closed;
                entry.failures = 0;
                entry.cooldown = self.config.base_cooldown;
                entry.trial_in_flight = false;
            }
            BreakerState::Closed => entry.failures = 0,
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self, endpoint: &str) {
        let now = Instant::now();
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(endpoint) else {
            return;
        };
        match entry.state {
            BreakerState::Closed => {
                if now.duration_since(entry.window_start) > self.config.failure_window {
                    entry.window_start = now;
                    entry.failures = 0;
                }
                entry.failures += 1;
                if entry.failures >= self.config.failure_threshold {
                    warn!(
                        "Circuit opened for {} after {} failures, cooldown {:?}",
                        endpoint, entry.failures, entry.cooldown
                    );
                    entry.state = BreakerState::Open;
                    entry.open_until = now + entry.cooldown;
                }
            }
            BreakerState::HalfOpen => {
                entry.cooldown = (entry.cooldown * 2).min(self.config.max_cooldown);
                warn!(
                    "Trial to {} failed, circuit reopened with cooldown {:?}",
                    endpoint, entry.cooldown
                );
                entry.state = BreakerState::Open;
                entry.open_until = now + entry.cooldown;
                entry.trial_in_flight = false;
            }
            BreakerState::Open => {}
        }
    }

    fn release_trial(&self, endpoint: &str) {
        if let Some(entry) = self.entries().get_mut(endpoint) {
            if entry.state == BreakerState::HalfOpen {
                entry.trial_in_flight = false;
            }
        }
    }
}

/// Admission to call one endpoint once.
pub struct BreakerPermit {
    table: Arc<BreakerTable>,
    endpoint: String,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.table.record_success(&self.endpoint);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.table.record_failure(&self.endpoint);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.table.release_trial(&self.endpoint);
        }
    }
}
