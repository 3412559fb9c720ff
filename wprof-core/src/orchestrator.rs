use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ProfilerConfig;
use crate::loader::{LoaderFactory, SystemLoaderFactory};
use crate::queue::{JobQueue, ResultQueue};
use crate::suite::{Job, LoadResult, LoadStatus, TestSuite};
use crate::worker::{Worker, WorkerContext};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no worker reached a working browser")]
    NoWorkersReady,
}

pub type RunResult<T> = std::result::Result<T, RunError>;

/// Outcome of a whole suite run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub results: Vec<LoadResult>,
    pub dispatched: usize,
    pub workers_ready: usize,
    pub interrupted: bool,
}

impl RunReport {
    pub fn successes(&self) -> usize {
        self.results
            .iter()
            .filter(|result| result.status == LoadStatus::Success)
            .count()
    }

    pub fn failures(&self) -> usize {
        self.results.len() - self.successes()
    }
}

/// Programmatic counterpart of ctrl-c: flips the shutdown watch and marks
/// the run interrupted. Obtained from [`TestRunner::interrupt_handle`].
#[derive(Clone)]
pub struct InterruptHandle {
    shutdown: Arc<watch::Sender<bool>>,
    interrupted: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// Drives a suite: spawns the worker pool, feeds it jobs, waits for the work
/// to drain, then poisons the pool and collects results.
pub struct TestRunner {
    suite: TestSuite,
    config: ProfilerConfig,
    outdir: PathBuf,
    factory: Arc<dyn LoaderFactory>,
    handle_signals: bool,
    interrupt: InterruptHandle,
    shutdown_rx: watch::Receiver<bool>,
}

impl TestRunner {
    pub fn new(suite: TestSuite, config: ProfilerConfig, outdir: PathBuf) -> Self {
        let factory = Arc::new(SystemLoaderFactory::new(
            config.clone(),
            suite.settings.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            suite,
            config,
            outdir,
            factory,
            handle_signals: true,
            interrupt: InterruptHandle {
                shutdown: Arc::new(shutdown_tx),
                interrupted: Arc::new(AtomicBool::new(false)),
            },
            shutdown_rx,
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn LoaderFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Disable the ctrl-c listener. Used by tests that drive interruption
    /// through [`TestRunner::interrupt_handle`] instead.
    pub fn without_signal_handling(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub async fn run(self) -> RunResult<RunReport> {
        let jobs = JobQueue::new();
        let mut results = ResultQueue::new();
        let shutdown_rx = self.shutdown_rx.clone();

        // The listener goes up before any browser is spawned; an interrupt
        // during worker setup must still run every teardown path.
        let signal_task = if self.handle_signals {
            let handle = self.interrupt.clone();
            Some(tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, shutting down");
                    handle.interrupt();
                }
            }))
        } else {
            None
        };

        let run_id = Uuid::new_v4();
        let trials = self.suite.expand_jobs();
        let dispatched = trials.len();
        for trial in trials {
            jobs.push(Job::Trial(trial)).await;
        }
        info!(
            run_id = %run_id,
            jobs = dispatched,
            workers = self.suite.parallelism,
            browser = %self.suite.settings.browser,
            "starting run"
        );

        // Worker pool. Each worker reports initial readiness once, and a
        // shared counter tracks how many are still alive so the queue can be
        // drained if the whole pool dies with work pending.
        let alive = Arc::new(AtomicUsize::new(self.suite.parallelism));
        let all_dead = Arc::new(Notify::new());
        let mut ready_rxs = Vec::with_capacity(self.suite.parallelism);
        let mut handles = Vec::with_capacity(self.suite.parallelism);
        for index in 0..self.suite.parallelism {
            let (ready_tx, ready_rx) = oneshot::channel();
            ready_rxs.push(ready_rx);
            let worker = Worker::new(WorkerContext {
                index: index as u32,
                jobs: jobs.clone(),
                results: results.sender(),
                factory: Arc::clone(&self.factory),
                outdir: self.outdir.clone(),
                shutdown: shutdown_rx.clone(),
                tcpdump: self.config.tools.tcpdump.clone(),
                grace: self.config.timeouts.grace(),
            });
            let alive = Arc::clone(&alive);
            let all_dead = Arc::clone(&all_dead);
            handles.push(tokio::spawn(async move {
                worker.run(ready_tx).await;
                if alive.fetch_sub(1, Ordering::SeqCst) == 1 {
                    all_dead.notify_waiters();
                }
            }));
        }

        let workers_ready = join_all(ready_rxs)
            .await
            .into_iter()
            .filter(|outcome| matches!(outcome, Ok(true)))
            .count();
        if workers_ready == 0 {
            error!("no worker came up, aborting run");
            jobs.drain_pending().await;
            let _ = self.interrupt.shutdown.send(true);
            join_all(handles).await;
            if let Some(task) = signal_task {
                task.abort();
            }
            return Err(RunError::NoWorkersReady);
        }
        if workers_ready < self.suite.parallelism {
            warn!(
                ready = workers_ready,
                requested = self.suite.parallelism,
                "continuing with a reduced worker pool"
            );
        }

        // If every worker dies mid-run, acknowledge the stranded jobs so the
        // join below can still resolve.
        let monitor = {
            let jobs = jobs.clone();
            let alive = Arc::clone(&alive);
            let all_dead = Arc::clone(&all_dead);
            tokio::spawn(async move {
                loop {
                    let notified = all_dead.notified();
                    if alive.load(Ordering::SeqCst) == 0 {
                        let stranded = jobs.drain_pending().await;
                        if stranded > 0 {
                            warn!(stranded, "all workers dead, dropping remaining jobs");
                        }
                        return;
                    }
                    notified.await;
                }
            })
        };

        jobs.join().await;

        // Poison the pool: one shutdown job per worker slot. Workers that
        // already died leave theirs behind; the final drain clears those.
        if !self.interrupt.is_interrupted() {
            for _ in 0..self.suite.parallelism {
                jobs.push(Job::Shutdown).await;
            }
        }

        let stop_limit = Duration::from_secs(self.config.timeouts.worker_stop_seconds);
        if tokio::time::timeout(stop_limit, join_all(&mut handles))
            .await
            .is_err()
        {
            warn!("workers did not stop in time, aborting them");
            for handle in &handles {
                handle.abort();
            }
        }
        if let Some(task) = signal_task {
            task.abort();
        }
        monitor.abort();
        jobs.drain_pending().await;

        let collected = results.drain();
        let report = RunReport {
            run_id,
            dispatched,
            workers_ready,
            interrupted: self.interrupt.is_interrupted(),
            results: collected,
        };
        info!(
            run_id = %report.run_id,
            dispatched = report.dispatched,
            completed = report.results.len(),
            successes = report.successes(),
            failures = report.failures(),
            interrupted = report.interrupted,
            "run finished"
        );
        Ok(report)
    }
}
