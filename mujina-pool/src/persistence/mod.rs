//! Share persistence pipeline.
//!
//! Connections hand accepted shares to a [`ShareRecorder`], which never
//! blocks them. A single consumer task drains the queue in order and writes
//! each share to a [`ShareStore`], retrying transient failures with
//! exponential backoff. Shares the store cannot take go to a
//! [`ShareFallback`], normally a [`RecoveryFile`] that can be replayed into
//! the store later with [`recover_shares`].
//!
//! # Message Flow
//!
//! ```text
//! connection ──enqueue──> [unbounded queue] ──> consumer ──> ShareStore
//!                                                  │ (retries exhausted)
//!                                                  └──────> ShareFallback
//! ```

mod file_store;
mod recorder;
mod recovery;

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::share::Share;

pub use file_store::JsonLinesStore;
pub use recorder::{share_recorder, ShareConsumer, ShareRecorder};
pub use recovery::{recover_shares, RecoveryFile, RecoveryReport};

/// Store failures, split by whether retrying can help.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connectivity or contention; worth retrying
    #[error("transient store error: {0}")]
    Transient(String),

    /// The share can never be written as is
    #[error("permanent store error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Durable share storage.
#[async_trait]
pub trait ShareStore: Send + Sync {
    async fn persist(&self, share: &Share) -> Result<(), StoreError>;
}

/// Last resort for shares the store would not take.
#[async_trait]
pub trait ShareFallback: Send + Sync {
    async fn handle(&self, share: &Share) -> anyhow::Result<()>;
}

/// Exponential backoff between store retries.
///
/// Starts at `initial` and doubles after each call to `next_delay()`,
/// capping at `max`. Each returned delay is jittered to [0.5, 1.0] of the
/// nominal value so retries from several pool instances spread out.
#[derive(Debug)]
struct ExponentialBackoff {
    current: Duration,
    max: Duration,
    jitter_state: RandomState,
    jitter_step: u64,
}

impl ExponentialBackoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max,
            jitter_state: RandomState::new(),
            jitter_step: 0,
        }
    }

    /// Return the next delay (with jitter) and advance the state.
    fn next_delay(&mut self) -> Duration {
        let nominal = self.current;
        self.current = (self.current * 2).min(self.max);

        let mut hasher = self.jitter_state.build_hasher();
        hasher.write_u64(self.jitter_step);
        self.jitter_step = self.jitter_step.wrapping_add(1);
        let jitter = 0.5 + (hasher.finish() as f64 / u64::MAX as f64) * 0.5;

        nominal.mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_each_step() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

        let d1 = backoff.next_delay();
        let d2 = backoff.next_delay();
        let d3 = backoff.next_delay();

        assert!(d1 >= Duration::from_millis(500) && d1 <= Duration::from_secs(1));
        assert!(d2 >= Duration::from_secs(1) && d2 <= Duration::from_secs(2));
        assert!(d3 >= Duration::from_secs(2) && d3 <= Duration::from_secs(4));
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(4), Duration::from_secs(6));
        let _ = backoff.next_delay();
        let d2 = backoff.next_delay();
        let d3 = backoff.next_delay();

        assert!(d2 <= Duration::from_secs(6));
        assert!(d3 <= Duration::from_secs(6));
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Transient("timeout".into()).is_transient());
        assert!(!StoreError::Permanent("constraint".into()).is_transient());
    }
}
