//! Job distribution loop.
//!
//! Polls the [`JobSource`] on a fixed interval and decides, on every tick,
//! between three outcomes:
//!
//! - a new chain tip: publish [`JobEvent::ReplaceJob`] (clean)
//! - no new block for longer than the rebroadcast timeout: ask the source to
//!   refresh the current job and publish [`JobEvent::UpdateJob`] (not clean)
//! - otherwise nothing
//!
//! Templates that regress in height, or that repeat the tip already held,
//! are dropped. A dropped template does not count as activity, so it does not
//! postpone the next rebroadcast.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::job_source::{FetchOutcome, Job, JobEvent, JobSource};
use crate::tracing::prelude::*;

pub struct JobDistributionLoop {
    source: Arc<dyn JobSource>,
    poll_interval: Duration,
    rebroadcast_timeout: Option<Duration>,
    current: Option<Arc<Job>>,
    last_broadcast: Option<Instant>,
}

impl JobDistributionLoop {
    pub fn new(
        source: Arc<dyn JobSource>,
        poll_interval: Duration,
        rebroadcast_timeout: Option<Duration>,
    ) -> Self {
        Self {
            source,
            poll_interval,
            rebroadcast_timeout,
            current: None,
            last_broadcast: None,
        }
    }

    /// The job most recently published.
    pub fn current(&self) -> Option<&Arc<Job>> {
        self.current.as_ref()
    }

    /// Run one poll cycle. Returns the event to publish, if any.
    pub async fn tick(&mut self, now: Instant) -> Option<JobEvent> {
        match self.source.try_get_next().await {
            Ok(FetchOutcome {
                job: Some(job),
                is_new: true,
            }) => {
                if self.adopts(&job) {
                    let job = job.with_clean(true);
                    info!(
                        job = %job.id,
                        height = job.height,
                        "New block, broadcasting clean job."
                    );
                    return Some(self.publish(JobEvent::ReplaceJob(job), now));
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to fetch job, retrying next tick.");
                return None;
            }
        }

        self.maybe_rebroadcast(now).await
    }

    /// Tick until `shutdown` is cancelled or the receiver goes away.
    pub async fn run(mut self, events: mpsc::Sender<JobEvent>, shutdown: CancellationToken) {
        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.tick(Instant::now()) => event,
            };

            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    debug!("Job event receiver closed.");
                    break;
                }
            }
        }

        debug!("Job distribution loop stopped.");
    }

    fn adopts(&self, job: &Job) -> bool {
        let Some(current) = &self.current else {
            return true;
        };

        if job.height < current.height {
            debug!(
                height = job.height,
                current = current.height,
                "Discarding stale template."
            );
            return false;
        }

        if job.block_hash == current.block_hash {
            trace!(height = job.height, "Template repeats current tip.");
            return false;
        }

        true
    }

    async fn maybe_rebroadcast(&mut self, now: Instant) -> Option<JobEvent> {
        let timeout = self.rebroadcast_timeout?;
        let current = self.current.clone()?;
        let last = self.last_broadcast?;

        if now.duration_since(last) < timeout {
            return None;
        }

        match self.source.force().await {
            Ok(job) => {
                let job = job.with_clean(false);
                if *job == *current {
                    trace!(job = %job.id, "Forced refresh produced identical job.");
                    return None;
                }
                debug!(job = %job.id, "No new block, rebroadcasting refreshed job.");
                Some(self.publish(JobEvent::UpdateJob(job), now))
            }
            Err(e) => {
                warn!(error = %e, "Failed to refresh job.");
                None
            }
        }
    }

    fn publish(&mut self, event: JobEvent, now: Instant) -> JobEvent {
        self.current = Some(event.job().clone());
        self.last_broadcast = Some(now);
        event
    }
}
