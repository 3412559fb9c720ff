use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::suite::{Job, LoadResult};

/// Multi-producer multi-consumer job queue with completion tracking.
///
/// Every pushed job must eventually be acknowledged with [`JobQueue::task_done`],
/// whether it was executed, skipped, or drained during cleanup. [`JobQueue::join`]
/// resolves once the acknowledgement count catches up with the push count.
#[derive(Debug, Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

#[derive(Debug)]
struct QueueInner {
    jobs: Mutex<VecDeque<Job>>,
    available: Notify,
    drained: Notify,
    outstanding: AtomicUsize,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                jobs: Mutex::new(VecDeque::new()),
                available: Notify::new(),
                drained: Notify::new(),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub async fn push(&self, job: Job) {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        self.inner.jobs.lock().await.push_back(job);
        self.inner.available.notify_one();
    }

    /// Take the next job, waiting until one is available.
    pub async fn recv(&self) -> Job {
        loop {
            // Register for wakeup before checking, so a push between the check
            // and the await cannot be missed.
            let notified = self.inner.available.notified();
            if let Some(job) = self.inner.jobs.lock().await.pop_front() {
                // Pass the wakeup along in case another job is also queued.
                self.inner.available.notify_one();
                return job;
            }
            notified.await;
        }
    }

    /// Try to take a job without waiting.
    pub async fn try_recv(&self) -> Option<Job> {
        self.inner.jobs.lock().await.pop_front()
    }

    /// Acknowledge one previously received job.
    pub fn task_done(&self) {
        let before = self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(before > 0, "task_done without matching push");
        if before == 1 {
            self.inner.drained.notify_waiters();
        }
    }

    /// Wait until every pushed job has been acknowledged.
    pub async fn join(&self) {
        loop {
            let notified = self.inner.drained.notified();
            if self.inner.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Remove and acknowledge every queued job. Used when no consumer is left
    /// alive, so that `join` can still resolve.
    pub async fn drain_pending(&self) -> usize {
        let mut jobs = self.inner.jobs.lock().await;
        let drained = jobs.len();
        jobs.clear();
        drop(jobs);
        for _ in 0..drained {
            self.task_done();
        }
        drained
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Result channel from workers back to the orchestrator. Sends never block;
/// the orchestrator drains after the job queue joins.
#[derive(Debug)]
pub struct ResultQueue {
    tx: mpsc::UnboundedSender<LoadResult>,
    rx: mpsc::UnboundedReceiver<LoadResult>,
}

impl ResultQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> ResultSender {
        ResultSender {
            tx: self.tx.clone(),
        }
    }

    /// Collect everything currently buffered without waiting.
    pub fn drain(&mut self) -> Vec<LoadResult> {
        let mut results = Vec::new();
        while let Ok(result) = self.rx.try_recv() {
            results.push(result);
        }
        results
    }
}

impl Default for ResultQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ResultSender {
    tx: mpsc::UnboundedSender<LoadResult>,
}

impl ResultSender {
    pub fn send(&self, result: LoadResult) {
        // The receiver outlives the workers during a run; a send after the
        // orchestrator dropped it only happens during teardown and the
        // result would be unreadable anyway.
        let _ = self.tx.send(result);
    }
}
