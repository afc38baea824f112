//! Mining pool coordination engine.
//!
//! Distributes work from a coin-specific [`job_source::JobSource`] to Stratum
//! v1 miners, validates their submissions through pluggable collaborators,
//! retargets per-connection difficulty, bans abusive addresses and records
//! accepted shares through a non-blocking persistence pipeline.

pub mod banning;
pub mod config;
pub mod error;
pub mod extranonce;
pub mod job_loop;
pub mod job_source;
pub mod persistence;
pub mod pool;
pub mod registry;
pub mod share;
pub mod stratum;
pub mod tracing;
pub mod validation;
pub mod vardiff;

pub use error::{Error, Result};
