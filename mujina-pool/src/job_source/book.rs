//! Jobs currently valid for share verification.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use super::Job;

/// Jobs issued since the last clean job, newest last.
///
/// A clean job empties the book before being added. The book holds at most
/// `capacity` jobs; the oldest is dropped first.
#[derive(Debug)]
pub struct ActiveJobs {
    jobs: RwLock<VecDeque<Arc<Job>>>,
    capacity: usize,
}

impl ActiveJobs {
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record a newly published job.
    pub fn push(&self, job: Arc<Job>) {
        let mut jobs = self.jobs.write();
        if job.clean {
            jobs.clear();
        }
        jobs.push_back(job);
        while jobs.len() > self.capacity {
            jobs.pop_front();
        }
    }

    /// The most recently published job.
    pub fn current(&self) -> Option<Arc<Job>> {
        self.jobs.read().back().cloned()
    }

    /// Look up a job miners may still submit against.
    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().iter().rev().find(|job| job.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}
