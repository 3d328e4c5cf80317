//! CLI command implementations.
//!
//! | Module      | Commands handled                                 |
//! |-------------|--------------------------------------------------|
//! | `lifecycle` | `Create`, `Finalize`, `Build`, `Run`, `SetJobId` |
//! | `inspect`   | `Status`, `Wait`, `Results`, `List`              |

pub mod inspect;
pub mod lifecycle;

pub use inspect::{cmd_list, cmd_results, cmd_status, cmd_wait};
pub use lifecycle::{cmd_build, cmd_create, cmd_finalize, cmd_run, cmd_set_job_id};
