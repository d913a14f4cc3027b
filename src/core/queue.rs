use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::QueueError;
use crate::models::job::{Job, JobKey, VideoKind};

struct Entry {
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap: the lowest priority value, then the oldest
    // insertion, must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .job
            .priority
            .cmp(&self.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    keys: HashSet<JobKey>,
    next_seq: u64,
}

/// Deduplicating priority queue of download jobs.
///
/// A job's identity is held from insertion until a consumer pops it, so
/// re-adding an equal job while it is still queued is a no-op.
#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job. Returns `Ok(false)` when an equal job is already queued.
    pub fn add(&self, job: Job) -> Result<bool, QueueError> {
        if job.physical_path.as_os_str().is_empty() {
            return Err(QueueError::EmptyPath);
        }
        if job.kind == VideoKind::Series && (job.season.is_none() || job.episode.is_none()) {
            return Err(QueueError::MissingEpisode(job.physical_path));
        }

        let key = job.key();
        {
            let mut state = self.state.lock();
            if !state.keys.insert(key) {
                return Ok(false);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            debug!(kind = %job.kind, path = %job.physical_path.display(), priority = job.priority, "Job queued");
            state.heap.push(Entry { seq, job });
        }
        self.notify.notify_one();
        Ok(true)
    }

    /// Remove the highest-priority job, if any.
    pub fn pop(&self) -> Option<Job> {
        let mut state = self.state.lock();
        let entry = state.heap.pop()?;
        state.keys.remove(&entry.job.key());
        Some(entry.job)
    }

    /// Wait for the next job.
    pub async fn next(&self) -> Job {
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.pop() {
                return job;
            }
            notified.await;
        }
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.state.lock().keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued jobs in the order they would be consumed.
    pub fn snapshot(&self) -> Vec<Job> {
        let state = self.state.lock();
        let mut entries: Vec<&Entry> = state.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.job.clone()).collect()
    }
}
