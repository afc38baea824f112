//! Pool coordinator.
//!
//! Wires the job source, the job distribution loop, the Stratum listeners,
//! the ban manager and the share pipeline together and runs them until
//! shutdown. Listeners open only once the first job is available, so no
//! client is ever subscribed without work to do.
//!
//! Shutdown order: the job loop, listeners and connections stop first; the
//! share consumer is stopped last so shares accepted during teardown still
//! reach the store.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::banning::BanManager;
use crate::config::Config;
use crate::error::Result;
use crate::extranonce::ExtraNonceAllocator;
use crate::job_loop::JobDistributionLoop;
use crate::job_source::{ActiveJobs, JobEvent, JobSource};
use crate::persistence::{share_recorder, ShareFallback, ShareStore};
use crate::registry::ConnectionRegistry;
use crate::stratum::{ConnectionServices, StratumListener};
use crate::tracing::prelude::*;
use crate::validation::{AddressValidator, ShareValidator};
use crate::vardiff::VarDiffManagers;

/// Buffered job events between the job loop and the dispatcher.
const JOB_EVENT_CAPACITY: usize = 16;

/// Collaborators supplied by the coin integration.
pub struct Collaborators {
    pub source: Arc<dyn JobSource>,
    pub address_validator: Arc<dyn AddressValidator>,
    pub share_validator: Arc<dyn ShareValidator>,
    pub store: Arc<dyn ShareStore>,
    pub fallback: Arc<dyn ShareFallback>,
}

pub struct Pool {
    config: Config,
    collaborators: Collaborators,
}

impl Pool {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Fails only if a listener cannot be bound.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Pool {
            config,
            collaborators,
        } = self;
        let settings = &config.pool;

        let jobs = Arc::new(ActiveJobs::new(settings.max_active_jobs));
        let registry = Arc::new(ConnectionRegistry::new());
        let bans = Arc::new(BanManager::new());
        let extranonce = Arc::new(ExtraNonceAllocator::new(
            settings.extranonce1_size,
            settings.instance_id,
        ));
        info!(
            pool = %settings.id,
            instance = extranonce.instance_id(),
            "Starting pool."
        );

        let tracker = TaskTracker::new();
        let persistence_shutdown = CancellationToken::new();
        let (recorder, consumer) = share_recorder(
            &config.persistence,
            collaborators.store.clone(),
            collaborators.fallback.clone(),
        );
        let consumer_task = tokio::spawn(consumer.run(persistence_shutdown.clone()));

        let (event_tx, mut event_rx) = mpsc::channel(JOB_EVENT_CAPACITY);
        let job_loop = JobDistributionLoop::new(
            collaborators.source.clone(),
            settings.job_poll_interval(),
            settings.job_rebroadcast_timeout(),
        );
        tracker.spawn(job_loop.run(event_tx, shutdown.clone()));

        let services = Arc::new(ConnectionServices {
            settings: settings.clone(),
            banning: config.banning.clone(),
            extranonce,
            jobs: jobs.clone(),
            vardiff: Arc::new(VarDiffManagers::new()),
            bans: bans.clone(),
            registry: registry.clone(),
            address_validator: collaborators.address_validator.clone(),
            share_validator: collaborators.share_validator.clone(),
            recorder,
        });

        info!("Waiting for first job.");
        let result: Result<()> = async {
            let first = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = event_rx.recv() => event,
            };
            let Some(first) = first else {
                return Ok(());
            };
            dispatch(&jobs, &registry, &first);

            for endpoint in &config.ports {
                let listener = StratumListener::bind(
                    &settings.listen_address,
                    Arc::new(endpoint.clone()),
                    services.clone(),
                )
                .await?;
                tracker.spawn(listener.run(tracker.clone(), shutdown.clone()));
            }

            tracker.spawn(
                // Counters idle for a ban period are forgotten
                bans.clone().run_purge(
                    config.banning.purge_interval(),
                    config.banning.ban_time(),
                    shutdown.clone(),
                ),
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => dispatch(&jobs, &registry, &event),
                        None => break,
                    },
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = &result {
            error!(error = %e, "Pool failed, shutting down.");
        }
        shutdown.cancel();
        tracker.close();
        tracker.wait().await;
        drop(services);

        persistence_shutdown.cancel();
        if let Err(e) = consumer_task.await {
            error!(error = %e, "Share consumer failed.");
        }
        info!("Pool stopped.");
        result
    }
}

/// Record a published job and announce it to every connection.
fn dispatch(jobs: &ActiveJobs, registry: &ConnectionRegistry, event: &JobEvent) {
    let job = event.job();
    jobs.push(job.clone());

    let report = registry.broadcast(job);
    info!(
        job = %job.id,
        height = job.height,
        clean = event.is_clean(),
        delivered = report.delivered,
        kicked = report.kicked,
        "Broadcast job."
    );
}
