//! Shared-filesystem primitives.
//!
//! Every cross-process guarantee the harness makes rests on one of these:
//! - `LockFile`: exclusive advisory lock, bounded wait, released on drop
//! - `ids`: first-fit run id allocation under the id lock
//! - `ConfigFile`: JSON document read and written under its own lock
//! - `RunOptions`: write-once options record
//! - `CompletionMarker`: unlocked single-write marker polled by observers

pub mod completion;
pub mod config_file;
pub mod ids;
pub mod lock;
pub mod options;

pub use completion::CompletionMarker;
pub use config_file::ConfigFile;
pub use ids::{allocate_id, latest_runs, run_path};
pub use lock::{LockFile, LockGuard};
pub use options::RunOptions;
