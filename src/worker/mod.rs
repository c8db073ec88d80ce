//! Fulfillment workers.
//!
//! - [`fulfill`]: decides what one delivery should do and commits to the store
//! - [`runner`]: the receive / process / ack-or-nack loop
//! - [`poll`]: idle polling with per-worker jitter
//! - [`sweep`]: periodic purge of expired ledger entries
//!
//! # Outcomes
//!
//! | Ledger entry                     | Store result | Queue action |
//! |----------------------------------|--------------|--------------|
//! | missing, expired, other claim    | not called   | ack          |
//! | `Committed`                      | not called   | ack          |
//! | `Claimed`, live, this claim      | success      | ack          |
//! |                                  | transient    | nack         |
//! |                                  | permanent    | ack + record |
//! | read failed                      | not called   | nack         |

pub mod fulfill;
pub mod poll;
pub mod runner;
pub mod sweep;

#[cfg(test)]
mod tests;

pub use fulfill::{DuplicateReason, Fulfiller, FulfillerConfig, Fulfillment};
pub use poll::PollConfig;
pub use runner::{INTERRUPTED, RunOutcome, Worker, spawn_workers};
pub use sweep::{run_ledger_sweeper, sweep_once};
