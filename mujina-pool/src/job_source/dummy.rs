//! Job source that generates synthetic work locally.
//!
//! Useful for:
//! - Exercising miners and the protocol without a coin daemon
//! - Integration tests of the pool core
//!
//! Block hashes are SHA-256 digests of the height, so every height gets a
//! distinct, stable tip. The chain advances on a timer or on demand.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::{FetchOutcome, Job, JobSource};
use crate::error::Result;
use crate::tracing::prelude::*;

/// Generates jobs on a synthetic chain.
pub struct DummySource {
    state: Mutex<DummyState>,
    network_difficulty: f64,
    block_interval: Option<Duration>,
}

struct DummyState {
    height: u64,
    /// Height last reported through `try_get_next`
    reported_height: Option<u64>,
    last_block: Instant,
    next_job_id: u64,
    time_offset: u32,
}

impl DummySource {
    /// Create a source starting at `height`. With a `block_interval`, the
    /// chain advances by one block each time the interval elapses.
    pub fn new(height: u64, network_difficulty: f64, block_interval: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(DummyState {
                height,
                reported_height: None,
                last_block: Instant::now(),
                next_job_id: 1,
                time_offset: 0,
            }),
            network_difficulty,
            block_interval,
        }
    }

    /// Mine a block on the synthetic chain.
    pub fn advance_block(&self) {
        let mut state = self.state.lock();
        state.height += 1;
        state.last_block = Instant::now();
        debug!(height = state.height, "Synthetic block found.");
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    fn build_job(&self, state: &mut DummyState, clean: bool) -> Arc<Job> {
        let id = format!("{:x}", state.next_job_id);
        state.next_job_id += 1;

        let ntime = unix_time().wrapping_add(state.time_offset);
        let prev_hash = block_hash(state.height.saturating_sub(1));

        Arc::new(Job {
            id,
            height: state.height,
            block_hash: prev_hash.clone(),
            network_difficulty: self.network_difficulty,
            payload: payload(&prev_hash, state.height, ntime),
            clean,
        })
    }
}

#[async_trait]
impl JobSource for DummySource {
    async fn try_get_next(&self) -> Result<FetchOutcome> {
        let mut state = self.state.lock();

        if let Some(interval) = self.block_interval {
            if state.last_block.elapsed() >= interval {
                state.height += 1;
                state.last_block = Instant::now();
            }
        }

        if state.reported_height == Some(state.height) {
            return Ok(FetchOutcome::unchanged());
        }

        state.reported_height = Some(state.height);
        let job = self.build_job(&mut state, true);
        Ok(FetchOutcome::new_block(job))
    }

    async fn force(&self) -> Result<Arc<Job>> {
        let mut state = self.state.lock();
        state.time_offset = state.time_offset.wrapping_add(1);
        Ok(self.build_job(&mut state, false))
    }
}

fn block_hash(height: u64) -> String {
    hex::encode(Sha256::digest(height.to_le_bytes()))
}

// Shaped like a Bitcoin notify: prevhash, coinbase halves, merkle branches,
// version, nbits, ntime.
fn payload(prev_hash: &str, height: u64, ntime: u32) -> Vec<Value> {
    let coinb1 = format!("01000000010000000000000000{:016x}", height);
    vec![
        json!(prev_hash),
        json!(coinb1),
        json!("ffffffff"),
        json!([]),
        json!("20000000"),
        json!("1d00ffff"),
        json!(format!("{:08x}", ntime)),
    ]
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
