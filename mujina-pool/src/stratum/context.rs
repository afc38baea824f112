//! Per-connection protocol state.
//!
//! Owned by the connection task and mutated only from it.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::banning::ShareStats;
use crate::config::EndpointConfig;
use crate::registry::ConnectionId;
use crate::validation::WorkerIdentity;
use crate::vardiff::{VarDiffContext, VarDiffManager};

/// Jobs whose notify-time difficulty is remembered.
const JOB_DIFFICULTY_HISTORY: usize = 16;

#[derive(Debug)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub endpoint: Arc<EndpointConfig>,
    pub created: Instant,
    pub last_activity: Instant,
    pub last_receive: Option<Instant>,
    pub subscribed: bool,
    pub authorized: bool,
    pub extranonce1: Option<String>,
    pub user_agent: Option<String>,
    pub miner: Option<String>,
    pub worker: Option<String>,
    pub stats: ShareStats,
    difficulty: f64,
    previous_difficulty: Option<f64>,
    pending_difficulty: Option<f64>,
    job_difficulty: VecDeque<(String, f64)>,
    vardiff: Option<(Arc<VarDiffManager>, VarDiffContext)>,
}

impl ConnectionContext {
    pub fn new(
        id: ConnectionId,
        remote: SocketAddr,
        endpoint: Arc<EndpointConfig>,
        vardiff: Option<Arc<VarDiffManager>>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            remote,
            difficulty: endpoint.difficulty,
            endpoint,
            created: now,
            last_activity: now,
            last_receive: None,
            subscribed: false,
            authorized: false,
            extranonce1: None,
            user_agent: None,
            miner: None,
            worker: None,
            stats: ShareStats::default(),
            previous_difficulty: None,
            pending_difficulty: None,
            job_difficulty: VecDeque::new(),
            vardiff: vardiff.map(|manager| (manager, VarDiffContext::new())),
        }
    }

    /// Note an inbound request.
    pub fn mark_receive(&mut self, now: Instant) {
        self.last_receive = Some(now);
        self.last_activity = now;
    }

    /// Silent for longer than `timeout`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_activity) > timeout
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    pub fn previous_difficulty(&self) -> Option<f64> {
        self.previous_difficulty
    }

    pub fn pending_difficulty(&self) -> Option<f64> {
        self.pending_difficulty
    }

    /// Queue a difficulty for the next job announcement, replacing any
    /// value queued earlier.
    pub fn enqueue_difficulty(&mut self, difficulty: f64) {
        self.pending_difficulty = Some(difficulty);
    }

    /// Make the queued difficulty current. Returns it if it changed the
    /// current difficulty.
    pub fn apply_pending_difficulty(&mut self) -> Option<f64> {
        let pending = self.pending_difficulty.take()?;
        if pending == self.difficulty {
            return None;
        }
        self.previous_difficulty = Some(self.difficulty);
        self.difficulty = pending;
        Some(pending)
    }

    /// Pin the difficulty and stop retargeting this connection.
    pub fn set_static_difficulty(&mut self, difficulty: f64) {
        self.vardiff = None;
        self.enqueue_difficulty(difficulty);
    }

    /// Feed an accepted share to vardiff; a proposal becomes pending.
    pub fn update_vardiff(&mut self, network_difficulty: Option<f64>, now: Instant) -> Option<f64> {
        let (manager, ctx) = self.vardiff.as_mut()?;
        let proposed = manager.update(ctx, self.difficulty, network_difficulty, now)?;
        self.enqueue_difficulty(proposed);
        Some(proposed)
    }

    /// Remember the difficulty a job was announced with.
    pub fn record_notify(&mut self, job_id: &str) {
        self.job_difficulty.retain(|(id, _)| id != job_id);
        self.job_difficulty.push_back((job_id.to_owned(), self.difficulty));
        while self.job_difficulty.len() > JOB_DIFFICULTY_HISTORY {
            self.job_difficulty.pop_front();
        }
    }

    /// Difficulty a share for `job_id` is credited with: the one in effect
    /// when the job was announced to this connection.
    pub fn difficulty_for_job(&self, job_id: &str) -> f64 {
        self.job_difficulty
            .iter()
            .rev()
            .find(|(id, _)| id == job_id)
            .map(|(_, difficulty)| *difficulty)
            .unwrap_or(self.difficulty)
    }

    pub fn identity(&self, pool_id: &str) -> WorkerIdentity {
        WorkerIdentity {
            pool_id: pool_id.to_owned(),
            miner: self.miner.clone().unwrap_or_default(),
            worker: self.worker.clone(),
            user_agent: self.user_agent.clone(),
            ip: self.remote.ip(),
            extranonce1: self.extranonce1.clone().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ConnectionContext {
        let endpoint = Arc::new(EndpointConfig {
            port: 3333,
            name: None,
            difficulty: 8.0,
            vardiff: None,
            banning: None,
        });
        let registry = crate::registry::ConnectionRegistry::new();
        ConnectionContext::new(
            registry.next_id(),
            "127.0.0.1:5000".parse().unwrap(),
            endpoint,
            None,
            Instant::now(),
        )
    }

    #[test]
    fn test_second_enqueue_replaces_pending() {
        let mut ctx = context();
        ctx.enqueue_difficulty(16.0);
        ctx.enqueue_difficulty(32.0);

        assert_eq!(ctx.difficulty(), 8.0);
        assert_eq!(ctx.apply_pending_difficulty(), Some(32.0));
        assert_eq!(ctx.difficulty(), 32.0);
        assert_eq!(ctx.previous_difficulty(), Some(8.0));
    }

    #[test]
    fn test_pending_applied_once() {
        let mut ctx = context();
        ctx.enqueue_difficulty(16.0);
        assert_eq!(ctx.apply_pending_difficulty(), Some(16.0));
        assert_eq!(ctx.apply_pending_difficulty(), None);
        assert_eq!(ctx.pending_difficulty(), None);
    }

    #[test]
    fn test_unchanged_pending_is_not_reported() {
        let mut ctx = context();
        ctx.enqueue_difficulty(8.0);
        assert_eq!(ctx.apply_pending_difficulty(), None);
        assert_eq!(ctx.previous_difficulty(), None);
    }

    #[test]
    fn test_share_credited_with_notify_time_difficulty() {
        let mut ctx = context();
        ctx.record_notify("a");
        ctx.enqueue_difficulty(64.0);
        assert_eq!(ctx.difficulty_for_job("a"), 8.0);

        ctx.apply_pending_difficulty();
        ctx.record_notify("b");
        assert_eq!(ctx.difficulty_for_job("a"), 8.0);
        assert_eq!(ctx.difficulty_for_job("b"), 64.0);
        assert_eq!(ctx.difficulty_for_job("unknown"), 64.0);
    }

    #[test]
    fn test_idle() {
        let mut ctx = context();
        let now = Instant::now();
        ctx.mark_receive(now);
        assert!(!ctx.is_idle(now + Duration::from_secs(10), Duration::from_secs(10)));
        assert!(ctx.is_idle(now + Duration::from_secs(11), Duration::from_secs(10)));
    }
}
