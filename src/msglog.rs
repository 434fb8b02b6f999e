use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::store::record::JobStatus;

const PER_JOB_CAPACITY: usize = 32;
const MAX_TRACKED_JOBS: usize = 10_000;

/// One diagnostic line recorded for a status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub at: DateTime<Utc>,
    pub status: JobStatus,
    pub detail: String,
}

/// Per-job append-only ring of status messages. Purely diagnostic: writes are
/// best-effort and never participate in the lifecycle transaction.
#[derive(Default)]
pub struct MessageLog {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    per_job: HashMap<String, VecDeque<StatusMessage>>,
    insertion_order: VecDeque<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, job_id: &str, status: JobStatus, detail: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.per_job.contains_key(job_id) {
            if inner.insertion_order.len() >= MAX_TRACKED_JOBS {
                if let Some(evicted) = inner.insertion_order.pop_front() {
                    inner.per_job.remove(&evicted);
                }
            }
            inner.insertion_order.push_back(job_id.to_string());
        }

        let ring = inner.per_job.entry(job_id.to_string()).or_default();
        if ring.len() >= PER_JOB_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(StatusMessage {
            at: Utc::now(),
            status,
            detail: detail.into(),
        });
    }

    pub fn messages(&self, job_id: &str) -> Vec<StatusMessage> {
        self.inner
            .lock()
            .unwrap()
            .per_job
            .get(job_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }
}
