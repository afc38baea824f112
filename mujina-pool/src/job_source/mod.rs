//! Upstream work abstraction.
//!
//! A [`JobSource`] is the coin-specific side of the pool: it talks to a
//! blockchain daemon and turns block templates into immutable [`Job`]s. The
//! pool core only ever asks two questions of it, "is there new work?" and
//! "refresh the current work", and fans the answers out as [`JobEvent`]s.
//!
//! [`ActiveJobs`] remembers the jobs issued since the last clean job so late
//! submissions against older jobs can still be verified.

mod book;
pub mod dummy;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub use book::ActiveJobs;
pub use dummy::DummySource;

/// One unit of distributable work. Never mutated once published.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Job identifier sent to miners (hex)
    pub id: String,

    /// Height of the block this job builds
    pub height: u64,

    /// Hash of the chain tip the job builds on
    pub block_hash: String,

    /// Network difficulty when the template was fetched
    pub network_difficulty: f64,

    /// Coin-specific notify fields, placed between the job id and the clean
    /// flag in `mining.notify`
    pub payload: Vec<Value>,

    /// Clients must discard in-flight work
    pub clean: bool,
}

impl Job {
    /// Parameters for a `mining.notify` announcing this job.
    pub fn notify_params(&self) -> Value {
        let mut params = Vec::with_capacity(self.payload.len() + 2);
        params.push(Value::String(self.id.clone()));
        params.extend(self.payload.iter().cloned());
        params.push(Value::Bool(self.clean));
        Value::Array(params)
    }

    /// Return this job with the clean flag set as given, copying only when
    /// the flag differs.
    pub fn with_clean(self: Arc<Self>, clean: bool) -> Arc<Self> {
        if self.clean == clean {
            self
        } else {
            Arc::new(Job {
                clean,
                ..(*self).clone()
            })
        }
    }
}

/// Result of asking the source for work.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Latest job, if the source produced one
    pub job: Option<Arc<Job>>,

    /// The job builds on a chain tip not seen before
    pub is_new: bool,
}

impl FetchOutcome {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn new_block(job: Arc<Job>) -> Self {
        Self {
            job: Some(job),
            is_new: true,
        }
    }
}

/// Coin-specific supplier of work.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Fetch the upstream template and report whether it is new.
    async fn try_get_next(&self) -> Result<FetchOutcome>;

    /// Rebuild the current job with refreshed transient fields (e.g. time).
    async fn force(&self) -> Result<Arc<Job>>;
}

/// Events published by the job distribution loop.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// New chain tip; all previous work is void.
    ReplaceJob(Arc<Job>),

    /// Same chain tip, refreshed job; previous work stays valid.
    UpdateJob(Arc<Job>),
}

impl JobEvent {
    pub fn job(&self) -> &Arc<Job> {
        match self {
            JobEvent::ReplaceJob(job) | JobEvent::UpdateJob(job) => job,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, JobEvent::ReplaceJob(_))
    }
}
