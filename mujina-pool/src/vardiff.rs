//! Adaptive per-connection difficulty.
//!
//! A [`VarDiffManager`] holds one port's read-only policy; the rolling
//! measurements live in a [`VarDiffContext`] owned by each connection. The
//! manager is therefore shared freely between connection tasks without
//! locking. [`VarDiffManagers`] creates managers on first use per port.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::VarDiffConfig;

/// Share intervals kept for the rolling average.
const BUFFER_SIZE: usize = 10;

/// Floor for the observed interval, keeps bursts from dividing by zero.
const MIN_AVERAGE_SECS: f64 = 0.001;

/// Per-connection measurement state.
#[derive(Debug, Default, Clone)]
pub struct VarDiffContext {
    last_share: Option<Instant>,
    last_retarget: Option<Instant>,
    intervals: VecDeque<f64>,
}

impl VarDiffContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Retargeting policy for one port.
#[derive(Debug)]
pub struct VarDiffManager {
    config: VarDiffConfig,
    retarget_time: Duration,
    t_min: f64,
    t_max: f64,
}

impl VarDiffManager {
    pub fn new(config: VarDiffConfig) -> Self {
        let variance = config.target_time * (config.variance_percent / 100.0);
        Self {
            retarget_time: Duration::try_from_secs_f64(config.retarget_time.max(0.0))
                .unwrap_or(Duration::MAX),
            t_min: config.target_time - variance,
            t_max: config.target_time + variance,
            config,
        }
    }

    pub fn config(&self) -> &VarDiffConfig {
        &self.config
    }

    /// Record a share at `now` and propose a new difficulty, if one is due.
    ///
    /// The first share only starts the clock. Afterwards a proposal is made
    /// once `retarget_time` has passed since the last retarget and the
    /// average interval lies outside the variance band around
    /// `target_time`. Proposals are clamped to `min_diff` and to the lower
    /// of `max_diff` and `network_difficulty`.
    pub fn update(
        &self,
        ctx: &mut VarDiffContext,
        difficulty: f64,
        network_difficulty: Option<f64>,
        now: Instant,
    ) -> Option<f64> {
        let Some(last_share) = ctx.last_share else {
            ctx.last_share = Some(now);
            ctx.last_retarget = Some(now);
            return None;
        };

        let since_last = now.duration_since(last_share).as_secs_f64();
        let sum: f64 = ctx.intervals.iter().sum();
        let average = (sum + since_last) / (ctx.intervals.len() + 1) as f64;

        if ctx.intervals.len() == BUFFER_SIZE {
            ctx.intervals.pop_front();
        }
        ctx.intervals.push_back(since_last);
        ctx.last_share = Some(now);

        let last_retarget = ctx.last_retarget.unwrap_or(now);
        if now.duration_since(last_retarget) < self.retarget_time {
            return None;
        }

        if average >= self.t_min && average <= self.t_max {
            return None;
        }

        let mut proposed = difficulty * self.config.target_time / average.max(MIN_AVERAGE_SECS);

        if let Some(max_delta) = self.config.max_delta {
            let delta = proposed - difficulty;
            if delta.abs() > max_delta {
                proposed = difficulty + max_delta.copysign(delta);
            }
        }

        let upper = [self.config.max_diff, network_difficulty]
            .into_iter()
            .flatten()
            .fold(f64::INFINITY, f64::min);
        let proposed = proposed.min(upper).max(self.config.min_diff);

        if (proposed - difficulty).abs() <= f64::EPSILON * difficulty.abs().max(1.0) {
            return None;
        }

        ctx.last_retarget = Some(now);
        ctx.intervals.clear();
        Some(proposed)
    }
}

/// Vardiff managers keyed by port, created on first use.
#[derive(Debug, Default)]
pub struct VarDiffManagers {
    managers: Mutex<HashMap<u16, Arc<VarDiffManager>>>,
}

impl VarDiffManagers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, port: u16, config: &VarDiffConfig) -> Arc<VarDiffManager> {
        self.managers
            .lock()
            .entry(port)
            .or_insert_with(|| Arc::new(VarDiffManager::new(config.clone())))
            .clone()
    }
}
