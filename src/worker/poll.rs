//! Idle polling for queue consumers.
//!
//! A worker that finds the queue empty sleeps for the poll interval before
//! asking again. Each worker's interval is stretched by a deterministic jitter
//! derived from its ID, and first polls are staggered, so a pool of workers
//! started together doesn't poll in lockstep.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

/// Default idle poll interval (500 milliseconds).
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default jitter percentage (0-100).
const DEFAULT_JITTER_PERCENT: u8 = 20;

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Sleep between polls while the queue has nothing visible.
    pub poll_interval: Duration,

    /// Maximum stretch added to the interval, in percent.
    pub jitter_percent: u8,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_POLL_INTERVAL_MS))
    }
}

impl PollConfig {
    pub fn new(poll_interval: Duration) -> Self {
        PollConfig {
            poll_interval,
            jitter_percent: DEFAULT_JITTER_PERCENT,
        }
    }

    /// The idle interval for one worker.
    ///
    /// `interval * (1 + (hash(worker) % jitter_percent) / 100)`
    pub fn idle_delay(&self, worker_id: usize) -> Duration {
        self.poll_interval.mul_f64(self.jitter_factor(worker_id))
    }

    /// Delay before a worker's first poll, below half the interval.
    pub fn initial_delay(&self, worker_id: usize) -> Duration {
        let max_ms = (self.poll_interval.as_millis() / 2).max(1) as u64;
        Duration::from_millis(worker_hash(worker_id) % max_ms)
    }

    fn jitter_factor(&self, worker_id: usize) -> f64 {
        if self.jitter_percent == 0 {
            return 1.0;
        }
        let jitter = (worker_hash(worker_id) % self.jitter_percent as u64) as f64 / 100.0;
        1.0 + jitter
    }
}

fn worker_hash(worker_id: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    worker_id.hash(&mut hasher);
    hasher.finish()
}
