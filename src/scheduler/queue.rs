use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::store::record::Role;

/// In-memory descriptor of an admitted job waiting for a worker. The program
/// payload itself stays in the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: String,
    pub backend: String,
    pub role: Role,
    pub size_bytes: u64,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    RejectedMemory,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<QueueEntry>>,
    total_bytes: u64,
}

/// Per-backend FIFO of admitted jobs, bounded by a shared byte budget.
/// `take` blocks until an entry arrives for the backend or the caller's
/// cancellation fires.
pub struct JobQueue {
    max_total_bytes: u64,
    state: Mutex<QueueState>,
    notifiers: Mutex<HashMap<String, Arc<Notify>>>,
}

impl JobQueue {
    pub fn new(max_total_bytes: u64) -> Self {
        Self {
            max_total_bytes,
            state: Mutex::new(QueueState::default()),
            notifiers: Mutex::new(HashMap::new()),
        }
    }

    fn notifier(&self, backend: &str) -> Arc<Notify> {
        self.notifiers
            .lock()
            .unwrap()
            .entry(backend.to_string())
            .or_default()
            .clone()
    }

    pub fn enqueue(&self, entry: QueueEntry) -> EnqueueOutcome {
        let backend = entry.backend.clone();
        {
            let mut state = self.state.lock().unwrap();
            if state.total_bytes + entry.size_bytes > self.max_total_bytes {
                return EnqueueOutcome::RejectedMemory;
            }
            state.total_bytes += entry.size_bytes;
            state.queues.entry(backend.clone()).or_default().push_back(entry);
        }
        self.notifier(&backend).notify_one();
        EnqueueOutcome::Enqueued
    }

    pub fn try_take(&self, backend: &str) -> Option<QueueEntry> {
        let mut state = self.state.lock().unwrap();
        let entry = state.queues.get_mut(backend)?.pop_front()?;
        state.total_bytes -= entry.size_bytes;
        Some(entry)
    }

    /// Blocking take. Returns `None` when `cancel` fires first. Wakeups are
    /// registered before the queue is checked, so an enqueue between the check
    /// and the await cannot be lost.
    pub async fn take(&self, backend: &str, cancel: &CancellationToken) -> Option<QueueEntry> {
        let notify = self.notifier(backend);
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_take(backend) {
                // Another entry may be waiting behind this one; pass the
                // wakeup along rather than swallowing it.
                notify.notify_one();
                return Some(entry);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Best-effort removal by id, used when a queued job is cancelled.
    pub fn remove(&self, job_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        for queue in state.queues.values_mut() {
            if let Some(index) = queue.iter().position(|e| e.job_id == job_id) {
                let entry = queue.remove(index).unwrap();
                state.total_bytes -= entry.size_bytes;
                return true;
            }
        }
        false
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().unwrap().total_bytes
    }

    pub fn len(&self, backend: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(backend)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, backend: &str) -> bool {
        self.len(backend) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(job_id: &str, backend: &str, size: u64) -> QueueEntry {
        QueueEntry {
            job_id: job_id.to_string(),
            backend: backend.to_string(),
            role: Role::Developer,
            size_bytes: size,
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn fifo_within_one_backend() {
        let queue = JobQueue::new(1024);
        queue.enqueue(entry("j1", "qpu", 10));
        queue.enqueue(entry("j2", "qpu", 10));
        queue.enqueue(entry("j3", "emulator", 10));

        assert_eq!(queue.try_take("qpu").unwrap().job_id, "j1");
        assert_eq!(queue.try_take("qpu").unwrap().job_id, "j2");
        assert_eq!(queue.try_take("emulator").unwrap().job_id, "j3");
        assert!(queue.try_take("qpu").is_none());
    }

    #[test]
    fn byte_budget_is_shared_across_backends() {
        let queue = JobQueue::new(25);
        assert_eq!(queue.enqueue(entry("j1", "qpu", 10)), EnqueueOutcome::Enqueued);
        assert_eq!(
            queue.enqueue(entry("j2", "emulator", 10)),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            queue.enqueue(entry("j3", "qpu", 10)),
            EnqueueOutcome::RejectedMemory
        );

        queue.remove("j1");
        assert_eq!(queue.enqueue(entry("j3", "qpu", 10)), EnqueueOutcome::Enqueued);
        assert_eq!(queue.total_bytes(), 20);
    }

    #[tokio::test]
    async fn take_wakes_on_enqueue() {
        let queue = Arc::new(JobQueue::new(1024));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.take("qpu", &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(entry("j1", "qpu", 10));

        let taken = waiter.await.unwrap().unwrap();
        assert_eq!(taken.job_id, "j1");
        assert_eq!(queue.total_bytes(), 0);
    }

    #[tokio::test]
    async fn take_returns_none_on_cancellation() {
        let queue = Arc::new(JobQueue::new(1024));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.take("qpu", &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn two_waiters_drain_two_entries() {
        let queue = Arc::new(JobQueue::new(1024));
        let cancel = CancellationToken::new();

        let mut waiters = Vec::new();
        for _ in 0..2 {
            let queue = queue.clone();
            let cancel = cancel.clone();
            waiters.push(tokio::spawn(async move { queue.take("qpu", &cancel).await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(entry("j1", "qpu", 10));
        queue.enqueue(entry("j2", "qpu", 10));

        let mut ids: Vec<String> = Vec::new();
        for waiter in waiters {
            ids.push(waiter.await.unwrap().unwrap().job_id);
        }
        ids.sort();
        assert_eq!(ids, vec!["j1".to_string(), "j2".to_string()]);
    }

    #[test]
    fn remove_missing_job_reports_false() {
        let queue = JobQueue::new(1024);
        queue.enqueue(entry("j1", "qpu", 10));
        assert!(queue.remove("j1"));
        assert!(!queue.remove("j1"));
    }
}
