//! Crash-safe local persistence.
//!
//! - [`fsync`]: atomic write-temp-then-rename with file and directory fsync
//! - [`snapshot`]: versioned JSON snapshots used by the local ledger and queue

pub mod fsync;
pub mod snapshot;

pub use fsync::{fsync_dir, fsync_file, write_atomic};
pub use snapshot::{SCHEMA_VERSION, SnapshotError, save_snapshot, try_load_snapshot};
