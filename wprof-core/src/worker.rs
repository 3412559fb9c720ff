use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::capture::PacketCapture;
use crate::deadline::run_with_deadline;
use crate::loader::{LoaderFactory, PageLoader};
use crate::queue::{JobQueue, ResultSender};
use crate::suite::{Job, LoadResult, LoadStatus, TrialJob};

/// Everything a worker needs, bundled so spawning stays readable.
pub struct WorkerContext {
    pub index: u32,
    pub jobs: JobQueue,
    pub results: ResultSender,
    pub factory: Arc<dyn LoaderFactory>,
    pub outdir: PathBuf,
    pub shutdown: watch::Receiver<bool>,
    pub tcpdump: String,
    /// Extra wall-clock allowance past the per-case timeout before the worker
    /// declares the loader hung.
    pub grace: Duration,
}

/// One worker: owns one loader at a time, pulls jobs until poisoned.
///
/// A trial that fails (timeout or otherwise) still produces exactly one
/// result and one queue acknowledgement; the worker then replaces its loader
/// before taking the next job. If a replacement cannot be brought up the
/// worker exits permanently and remaining jobs fall to its siblings.
pub struct Worker {
    ctx: WorkerContext,
}

enum TrialOutcome {
    Completed(LoadResult),
    LoaderBroken(LoadResult),
}

impl Worker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Run until poisoned or broken. `ready` reports whether the initial
    /// loader came up; the orchestrator counts these before dispatching.
    ///
    /// The shutdown signal wins over everything: it interrupts both the wait
    /// for the next job and a trial already in flight.
    pub async fn run(self, ready: oneshot::Sender<bool>) {
        let mut shutdown = self.ctx.shutdown.clone();
        let mut loader = match self.start_loader().await {
            Some(loader) => {
                let _ = ready.send(true);
                loader
            }
            None => {
                let _ = ready.send(false);
                return;
            }
        };

        loop {
            let job = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!(worker = self.ctx.index, "shutdown requested, stopping");
                    loader.teardown().await;
                    return;
                }
                job = self.ctx.jobs.recv() => job,
            };

            match job {
                Job::Shutdown => {
                    debug!(worker = self.ctx.index, "received shutdown job");
                    loader.teardown().await;
                    self.ctx.jobs.task_done();
                    return;
                }
                Job::Trial(trial) => {
                    let outcome = tokio::select! {
                        _ = wait_for_shutdown(&mut shutdown) => {
                            info!(
                                worker = self.ctx.index,
                                url = %trial.case.url,
                                trial = trial.trial,
                                "shutdown requested, abandoning trial"
                            );
                            // The abandoned job still gets its ack so the
                            // run can unwind; it just produces no result.
                            self.ctx.jobs.task_done();
                            loader.teardown().await;
                            return;
                        }
                        outcome = self.execute(loader.as_mut(), &trial) => outcome,
                    };
                    let (result, broken) = match outcome {
                        TrialOutcome::Completed(result) => (result, false),
                        TrialOutcome::LoaderBroken(result) => (result, true),
                    };
                    let restart = broken || result.status != LoadStatus::Success;
                    self.ctx.results.send(result);

                    if restart {
                        loader.teardown().await;
                        match self.start_loader().await {
                            Some(fresh) => loader = fresh,
                            None => {
                                self.ctx.jobs.task_done();
                                error!(
                                    worker = self.ctx.index,
                                    "could not replace loader, worker exiting"
                                );
                                return;
                            }
                        }
                    }
                    // Acked only once the worker is ready for the next job,
                    // so a drained queue implies recovery has finished too.
                    self.ctx.jobs.task_done();
                }
            }
        }
    }

    async fn start_loader(&self) -> Option<Box<dyn PageLoader>> {
        let mut loader = match self.ctx.factory.create(self.ctx.index).await {
            Ok(loader) => loader,
            Err(err) => {
                error!(worker = self.ctx.index, error = %err, "failed to build loader");
                return None;
            }
        };
        match loader.setup().await {
            Ok(()) => Some(loader),
            Err(err) => {
                error!(worker = self.ctx.index, error = %err, "loader setup failed");
                loader.teardown().await;
                None
            }
        }
    }

    /// Run one trial: optional packet capture around the measured load.
    async fn execute(&self, loader: &mut dyn PageLoader, job: &TrialJob) -> TrialOutcome {
        let capture = if job.case.capture_packets {
            match PacketCapture::start_system(&self.ctx.tcpdump, job, &self.ctx.outdir).await {
                Ok(capture) => Some(capture),
                Err(err) => {
                    warn!(worker = self.ctx.index, error = %err, "packet capture unavailable");
                    None
                }
            }
        } else {
            None
        };

        let outcome = self.drive(loader, job).await;

        if let Some(capture) = capture {
            capture.stop().await;
        }
        outcome
    }

    async fn drive(&self, loader: &mut dyn PageLoader, job: &TrialJob) -> TrialOutcome {
        // The loader enforces its own deadline; this outer one is wider and
        // only trips when the loader itself has hung.
        let limit = job.case.timeout + self.ctx.grace * 2;
        let fresh = job.case.fresh_view_per_trial || job.trial == 0;
        let attempt = async {
            if !job.case.preload.is_empty() {
                loader.preload_objects(&job.case.preload, fresh).await?;
            }
            loader.load_page(job, &self.ctx.outdir).await
        };

        match run_with_deadline(limit, attempt).await {
            Ok(Ok(result)) => TrialOutcome::Completed(result),
            Ok(Err(err)) => {
                warn!(
                    worker = self.ctx.index,
                    url = %job.case.url,
                    trial = job.trial,
                    error = %err,
                    "loader failed during trial"
                );
                TrialOutcome::LoaderBroken(LoadResult::failure(
                    LoadStatus::Failed,
                    &job.case.url,
                    job.trial,
                ))
            }
            Err(deadline) => {
                warn!(
                    worker = self.ctx.index,
                    url = %job.case.url,
                    trial = job.trial,
                    limit = ?deadline.0,
                    "loader hung past its deadline"
                );
                TrialOutcome::LoaderBroken(LoadResult::failure(
                    LoadStatus::Timeout,
                    &job.case.url,
                    job.trial,
                ))
            }
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // Resolves when the flag is (or becomes) true; never resolves otherwise.
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender gone without raising the flag: run to natural end.
            std::future::pending::<()>().await;
        }
    }
}
