//! # sfw-id
//!
//! Typed identifiers used by the sfw orchestration engine.
//!
//! Every id renders as `{prefix}_{ulid}`:
//!
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F` for a service instance
//! - `run_01HV4Z5PZQMVST1KVWB9YENF6G` for a single task execution
//!
//! ULIDs sort by creation time, so instance listings ordered by id are
//! ordered by start attempt.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;
