//! Runtime configuration for the `match-coordinator` binary.
//!
//! Every option is a CLI flag that can also come from the environment (and a
//! `.env` file, loaded in `main`). [`CliArgs`] is converted into a validated
//! [`CoordinatorConfig`], which hands each component its own config struct.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::queue::QueueConfig;
use crate::retry::RetryConfig;
use crate::store::AirtableConfig;
use crate::store::airtable::DEFAULT_BASE_URL;
use crate::verifier::VerifierConfig;
use crate::worker::{FulfillerConfig, PollConfig};

#[derive(Parser, Clone)]
#[command(
    name = "match-coordinator",
    version,
    about = "Deduplicating intake and delayed fulfillment of tutoring match requests"
)]
pub struct CliArgs {
    /// Address the HTTP front door listens on.
    #[arg(long, env = "MATCH_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: SocketAddr,

    /// Directory holding the ledger and queue snapshots and the dead-letter spool.
    #[arg(long, env = "MATCH_STATE_DIR", default_value = "data")]
    pub state_dir: PathBuf,

    /// Bearer token callers must present.
    #[arg(long, env = "MATCH_API_TOKEN", hide_env_values = true)]
    pub api_token: String,

    /// Seconds before an accepted request becomes visible to workers.
    #[arg(long, env = "MATCH_INITIAL_DELAY_SECS", default_value_t = 5)]
    pub initial_delay_secs: u64,

    /// Seconds a claim holds its learner/tutor pair.
    #[arg(long, env = "MATCH_CLAIM_TTL_SECS", default_value_t = 86_400)]
    pub claim_ttl_secs: u64,

    /// Seconds a received work item stays invisible to other workers.
    #[arg(long, env = "MATCH_LEASE_WINDOW_SECS", default_value_t = 60)]
    pub lease_window_secs: u64,

    /// Deliveries allowed before a work item is dead-lettered.
    #[arg(long, env = "MATCH_MAX_DELIVERIES", default_value_t = 4)]
    pub max_deliveries: u32,

    /// Seconds allowed for one commit to the external store.
    #[arg(long, env = "MATCH_STORE_TIMEOUT_SECS", default_value_t = 10)]
    pub store_timeout_secs: u64,

    /// Milliseconds allowed for each ledger or queue call.
    #[arg(long, env = "MATCH_DEPENDENCY_TIMEOUT_MS", default_value_t = 2_000)]
    pub dependency_timeout_ms: u64,

    /// Number of fulfillment workers.
    #[arg(long, env = "MATCH_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Milliseconds an idle worker waits before polling again.
    #[arg(long, env = "MATCH_POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Seconds between purges of expired ledger entries.
    #[arg(long, env = "MATCH_PURGE_INTERVAL_SECS", default_value_t = 300)]
    pub purge_interval_secs: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "MATCH_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    #[arg(long, env = "AIRTABLE_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub airtable_base_url: String,

    #[arg(long, env = "AIRTABLE_BASE_ID")]
    pub airtable_base_id: String,

    #[arg(long, env = "AIRTABLE_TOKEN", hide_env_values = true)]
    pub airtable_token: String,
}

impl fmt::Debug for CliArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CliArgs")
            .field("listen_addr", &self.listen_addr)
            .field("state_dir", &self.state_dir)
            .field("api_token", &"<redacted>")
            .field("airtable_base_id", &self.airtable_base_id)
            .field("airtable_token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must be greater than 0")]
    Zero(&'static str),

    /// A claim could expire while its work item can still be delivered.
    #[error(
        "MATCH_CLAIM_TTL_SECS ({claim_ttl:?}) must exceed the initial delay plus every lease window ({minimum:?})"
    )]
    ClaimTtlTooShort {
        claim_ttl: Duration,
        minimum: Duration,
    },

    /// A lease could lapse while its delivery is still writing to the store.
    #[error(
        "MATCH_LEASE_WINDOW_SECS ({lease_window:?}) must exceed the longest a delivery can take ({minimum:?})"
    )]
    LeaseTooShort {
        lease_window: Duration,
        minimum: Duration,
    },
}

/// Validated configuration for one coordinator process.
#[derive(Clone)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    pub state_dir: PathBuf,
    pub api_token: String,
    pub initial_delay: Duration,
    pub claim_ttl: Duration,
    pub lease_window: Duration,
    pub max_deliveries: u32,
    pub store_timeout: Duration,
    pub dependency_timeout: Duration,
    pub workers: usize,
    pub poll_interval: Duration,
    pub purge_interval: Duration,
    pub log_json: bool,
    pub airtable: AirtableConfig,
}

impl fmt::Debug for CoordinatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorConfig")
            .field("listen_addr", &self.listen_addr)
            .field("state_dir", &self.state_dir)
            .field("api_token", &"<redacted>")
            .field("initial_delay", &self.initial_delay)
            .field("claim_ttl", &self.claim_ttl)
            .field("lease_window", &self.lease_window)
            .field("max_deliveries", &self.max_deliveries)
            .field("store_timeout", &self.store_timeout)
            .field("dependency_timeout", &self.dependency_timeout)
            .field("workers", &self.workers)
            .field("poll_interval", &self.poll_interval)
            .field("purge_interval", &self.purge_interval)
            .field("log_json", &self.log_json)
            .field("airtable", &self.airtable)
            .finish()
    }
}

impl TryFrom<CliArgs> for CoordinatorConfig {
    type Error = ConfigError;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.api_token.trim().is_empty() {
            return Err(ConfigError::Empty("MATCH_API_TOKEN"));
        }
        if args.airtable_base_id.trim().is_empty() {
            return Err(ConfigError::Empty("AIRTABLE_BASE_ID"));
        }
        if args.airtable_token.trim().is_empty() {
            return Err(ConfigError::Empty("AIRTABLE_TOKEN"));
        }
        if args.workers == 0 {
            return Err(ConfigError::Zero("MATCH_WORKERS"));
        }
        if args.max_deliveries == 0 {
            return Err(ConfigError::Zero("MATCH_MAX_DELIVERIES"));
        }
        if args.lease_window_secs == 0 {
            return Err(ConfigError::Zero("MATCH_LEASE_WINDOW_SECS"));
        }
        if args.store_timeout_secs == 0 {
            return Err(ConfigError::Zero("MATCH_STORE_TIMEOUT_SECS"));
        }
        if args.dependency_timeout_ms == 0 {
            return Err(ConfigError::Zero("MATCH_DEPENDENCY_TIMEOUT_MS"));
        }
        if args.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("MATCH_POLL_INTERVAL_MS"));
        }
        if args.purge_interval_secs == 0 {
            return Err(ConfigError::Zero("MATCH_PURGE_INTERVAL_SECS"));
        }

        let initial_delay = Duration::from_secs(args.initial_delay_secs);
        let claim_ttl = Duration::from_secs(args.claim_ttl_secs);
        let lease_window = Duration::from_secs(args.lease_window_secs);

        let minimum = lease_window
            .checked_mul(args.max_deliveries)
            .and_then(|leases| leases.checked_add(initial_delay))
            .unwrap_or(Duration::MAX);
        if claim_ttl <= minimum {
            return Err(ConfigError::ClaimTtlTooShort { claim_ttl, minimum });
        }

        let store_timeout = Duration::from_secs(args.store_timeout_secs);
        let dependency_timeout = Duration::from_millis(args.dependency_timeout_ms);

        let minimum = fulfiller_config(store_timeout, dependency_timeout).max_processing_time();
        if lease_window <= minimum {
            return Err(ConfigError::LeaseTooShort {
                lease_window,
                minimum,
            });
        }

        Ok(Self {
            listen_addr: args.listen_addr,
            state_dir: args.state_dir,
            api_token: args.api_token,
            initial_delay,
            claim_ttl,
            lease_window,
            max_deliveries: args.max_deliveries,
            store_timeout,
            dependency_timeout,
            workers: args.workers,
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            purge_interval: Duration::from_secs(args.purge_interval_secs),
            log_json: args.log_json,
            airtable: AirtableConfig {
                base_url: args.airtable_base_url,
                base_id: args.airtable_base_id,
                token: args.airtable_token,
                timeout: store_timeout,
            },
        })
    }
}

fn fulfiller_config(store_timeout: Duration, dependency_timeout: Duration) -> FulfillerConfig {
    FulfillerConfig {
        store_timeout,
        dependency_timeout,
        finalize_retry: RetryConfig::DEFAULT,
    }
}

impl CoordinatorConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("ledger.json")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.state_dir.join("queue.json")
    }

    pub fn verifier(&self) -> VerifierConfig {
        VerifierConfig {
            claim_ttl: self.claim_ttl,
            initial_delay: self.initial_delay,
            dependency_timeout: self.dependency_timeout,
        }
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            lease_window: self.lease_window,
            max_deliveries: self.max_deliveries,
            capacity: None,
        }
    }

    pub fn fulfiller(&self) -> FulfillerConfig {
        fulfiller_config(self.store_timeout, self.dependency_timeout)
    }

    pub fn poll(&self) -> PollConfig {
        PollConfig::new(self.poll_interval)
    }
}
