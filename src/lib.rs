//! Match Coordinator - exactly-once intake of tutoring match requests.
//!
//! A request is verified and claimed in an idempotency ledger, parked in a
//! delayed work queue, and later committed to the external record store by a
//! pool of fulfillment workers. Failures are retried through queue redelivery
//! up to a bound, after which the work item is dead-lettered.

pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod ledger;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod server;
pub mod store;
pub mod types;
pub mod verifier;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;
