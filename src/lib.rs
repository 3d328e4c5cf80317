pub mod builder;
pub mod config;
pub mod errors;
pub mod executor;
pub mod results;
pub mod run;
pub mod script;
pub mod skip;
pub mod status;
pub mod store;
pub mod variables;

pub use errors::{RunError, StoreError};
pub use run::{RunContext, TestRun};
