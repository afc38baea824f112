//! Live connection registry and job fan-out.
//!
//! Each connection task registers a [`ConnectionHandle`]: its address, the
//! sending half of its bounded command queue and its cancellation token.
//! Protocol state stays inside the connection task; the registry only knows
//! how to reach it.
//!
//! Broadcasts iterate a snapshot taken under the lock, so connections may
//! come and go mid-broadcast. A connection whose queue is full is not
//! waited on; it is kicked.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::job_source::Job;
use crate::tracing::prelude::*;

/// Outbound commands queued per connection.
pub const SEND_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Work pushed to a connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionCommand {
    /// Announce a job (after applying any pending difficulty)
    Notify(Arc<Job>),
}

/// How the registry reaches one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub port: u16,
    tx: mpsc::Sender<ConnectionCommand>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        remote: SocketAddr,
        port: u16,
        tx: mpsc::Sender<ConnectionCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            remote,
            port,
            tx,
            cancel,
        }
    }

    /// Ask the connection task to hang up.
    pub fn kick(&self) {
        self.cancel.cancel();
    }
}

/// Counts from one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub kicked: usize,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn register(&self, handle: ConnectionHandle) {
        self.connections.write().insert(handle.id, handle);
    }

    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Handles of all currently registered connections.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections.read().values().cloned().collect()
    }

    /// Queue `job` for every registered connection.
    pub fn broadcast(&self, job: &Arc<Job>) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for handle in self.snapshot() {
            match handle.tx.try_send(ConnectionCommand::Notify(job.clone())) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    error!(conn = %handle.id, addr = %handle.remote, "Send queue stalled, disconnecting.");
                    handle.kick();
                    self.unregister(handle.id);
                    report.kicked += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(conn = %handle.id, "Connection closed during broadcast.");
                }
            }
        }

        report
    }
}
