//! TCP listener for one Stratum port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::{serve_connection, ConnectionServices};
use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct StratumListener {
    listener: TcpListener,
    endpoint: Arc<EndpointConfig>,
    services: Arc<ConnectionServices>,
}

impl StratumListener {
    /// Bind `address` on the endpoint's port.
    pub async fn bind(
        address: &str,
        endpoint: Arc<EndpointConfig>,
        services: Arc<ConnectionServices>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((address, endpoint.port))
            .await
            .map_err(|e| {
                Error::Config(format!("binding {}:{}: {}", address, endpoint.port, e))
            })?;
        Ok(Self {
            listener,
            endpoint,
            services,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `shutdown`, spawning one task per connection on
    /// `tracker`. Connections from banned addresses are dropped before any
    /// protocol exchange.
    pub async fn run(self, tracker: TaskTracker, shutdown: CancellationToken) {
        let name = self.endpoint.display_name();
        info!(port = self.endpoint.port, name = %name, "Stratum port listening.");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, remote) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(port = self.endpoint.port, error = %e, "Failed to accept connection.");
                    time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            if self.services.bans.is_banned(&remote.ip()) {
                debug!(addr = %remote, "Refusing banned address.");
                continue;
            }

            if let Err(e) = stream.set_nodelay(true) {
                debug!(addr = %remote, error = %e, "Failed to set TCP_NODELAY.");
            }

            tracker.spawn(serve_connection(
                stream,
                remote,
                self.endpoint.clone(),
                self.services.clone(),
                shutdown.clone(),
            ));
        }

        info!(port = self.endpoint.port, "Stratum port closed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::banning::BanManager;
    use crate::config::{BanningConfig, PoolSettings};
    use crate::extranonce::ExtraNonceAllocator;
    use crate::job_source::test_support::job;
    use crate::job_source::ActiveJobs;
    use crate::persistence::{share_recorder, JsonLinesStore, RecoveryFile};
    use crate::registry::ConnectionRegistry;
    use crate::validation::{PermissiveAddressValidator, PermissiveShareValidator};
    use crate::vardiff::VarDiffManagers;
    use serde_json::{json, Value};
    use std::path::Path;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    async fn services(dir: &Path) -> Arc<ConnectionServices> {
        let store = JsonLinesStore::open(dir.join("shares.jsonl")).await.unwrap();
        let fallback = RecoveryFile::new(dir.join("recovered-shares.txt"));
        let (recorder, _consumer) =
            share_recorder(&Default::default(), Arc::new(store), Arc::new(fallback));

        let jobs = Arc::new(ActiveJobs::new(8));
        jobs.push(job("1", 10, true));

        Arc::new(ConnectionServices {
            settings: PoolSettings::default(),
            banning: BanningConfig::default(),
            extranonce: Arc::new(ExtraNonceAllocator::new(4, Some(0))),
            jobs,
            vardiff: Arc::new(VarDiffManagers::new()),
            bans: Arc::new(BanManager::new()),
            registry: Arc::new(ConnectionRegistry::new()),
            address_validator: Arc::new(PermissiveAddressValidator),
            share_validator: Arc::new(PermissiveShareValidator::new(4)),
            recorder,
        })
    }

    fn endpoint() -> Arc<EndpointConfig> {
        Arc::new(EndpointConfig {
            port: 0,
            name: Some("test".into()),
            difficulty: 1.0,
            vardiff: None,
            banning: None,
        })
    }

    async fn start(services: Arc<ConnectionServices>) -> (SocketAddr, TaskTracker, CancellationToken) {
        let listener = StratumListener::bind("127.0.0.1", endpoint(), services).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        tracker.spawn(listener.run(tracker.clone(), shutdown.clone()));
        (addr, tracker, shutdown)
    }

    #[tokio::test]
    async fn test_subscribe_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path()).await;
        let (addr, tracker, shutdown) = start(services.clone()).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"test\"]}\n")
            .await
            .unwrap();

        let response: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["result"][1], "00000000");
        assert_eq!(services.registry.len(), 1);

        shutdown.cancel();
        tracker.close();
        tracker.wait().await;
        assert!(services.registry.is_empty());
    }

    #[tokio::test]
    async fn test_banned_address_refused() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path()).await;
        services
            .bans
            .ban("127.0.0.1".parse().unwrap(), Duration::from_secs(60));
        let (addr, tracker, shutdown) = start(services.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(services.registry.is_empty());

        shutdown.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path()).await;
        let first = StratumListener::bind("127.0.0.1", endpoint(), services.clone())
            .await
            .unwrap();
        let taken = first.local_addr().unwrap().port();

        let mut conflicting = (*endpoint()).clone();
        conflicting.port = taken;
        let second = StratumListener::bind("127.0.0.1", Arc::new(conflicting), services).await;
        assert!(matches!(second, Err(Error::Config(_))));
    }
}
