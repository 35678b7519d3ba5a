use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::OffloaderConfig;
use crate::error::Result;
use crate::notify::Notifier;
use crate::offload::command::OffloadFn;
use crate::offload::completion::CompletionService;
use crate::offload::job_directory::{JobDirectory, JobKind, OffloadOutcome, OffloadRequest};
use crate::offload::report::report_offload_failures;

/// Tallies from one pass over the open jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub new_jobs: usize,
    pub enqueued: usize,
    pub skipped: usize,
    pub removed: usize,
    pub open: usize,
    pub reported: bool,
}

/// Tracks open result directories and moves finished ones to long-term
/// storage.
///
/// Each cycle discovers new directories, enqueues the eligible ones to a pool
/// of workers, then forgets the jobs whose directories are gone. Jobs that
/// keep failing are reported, at most once per report interval.
pub struct Offloader {
    config: OffloaderConfig,
    kinds: Vec<JobKind>,
    offload_fn: OffloadFn,
    service: Arc<dyn CompletionService>,
    notifier: Arc<dyn Notifier>,
    open_jobs: BTreeMap<String, JobDirectory>,
    next_report_time: DateTime<Utc>,
}

impl Offloader {
    pub fn new(
        config: OffloaderConfig,
        service: Arc<dyn CompletionService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let mut kinds = Vec::new();
        if config.offload_regular {
            kinds.push(JobKind::Regular);
        }
        if config.offload_special {
            kinds.push(JobKind::Special);
        }
        let offload_fn = OffloadFn::from_config(&config);
        tracing::info!(
            root = %config.results_root.display(),
            kinds = ?kinds,
            parallelism = config.parallelism,
            age_limit_days = config.age_limit_days,
            delete_only = config.delete_only,
            "Offloader configured"
        );
        Self {
            config,
            kinds,
            offload_fn,
            service,
            notifier,
            open_jobs: BTreeMap::new(),
            next_report_time: Utc::now(),
        }
    }

    pub fn kinds(&self) -> &[JobKind] {
        &self.kinds
    }

    pub fn offload_fn(&self) -> &OffloadFn {
        &self.offload_fn
    }

    /// Open jobs keyed by directory name relative to the results root.
    pub fn open_jobs(&self) -> &BTreeMap<String, JobDirectory> {
        &self.open_jobs
    }

    pub fn next_report_time(&self) -> DateTime<Utc> {
        self.next_report_time
    }

    /// Start tracking directories that appeared since the last cycle. Jobs
    /// already tracked keep their state.
    pub fn add_new_jobs(&mut self) -> Result<usize> {
        let mut new_jobs = 0;
        for kind in &self.kinds {
            for dirname in kind.get_job_directories(&self.config.results_root)? {
                if self.open_jobs.contains_key(&dirname) {
                    continue;
                }
                let job = JobDirectory::new(*kind, &self.config.results_root, dirname.clone())?;
                self.open_jobs.insert(dirname, job);
                new_jobs += 1;
            }
        }
        tracing::debug!(new_jobs, "Start of offload cycle");
        Ok(new_jobs)
    }

    /// Run one full discovery, offload and bookkeeping cycle.
    pub async fn offload_once(&mut self) -> Result<CycleSummary> {
        if let Err(e) = self.service.refresh().await {
            tracing::warn!(error = %e, "Failed to refresh completion status");
        }

        let mut summary = CycleSummary {
            new_jobs: self.add_new_jobs()?,
            ..Default::default()
        };

        let (tx, rx) = mpsc::unbounded_channel::<OffloadRequest>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(self.config.parallelism);
        for _ in 0..self.config.parallelism.max(1) {
            let rx = rx.clone();
            let offload_fn = self.offload_fn.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let request = rx.lock().await.recv().await;
                    let Some(request) = request else {
                        break;
                    };
                    if let Err(e) = offload_fn.offload_dir(&request).await {
                        tracing::error!(
                            dir = %request.dir.display(),
                            error = %e,
                            "Offload failed"
                        );
                    }
                }
            }));
        }

        for job in self.open_jobs.values_mut() {
            match job
                .enqueue_offload(&tx, self.config.age_limit_days, self.service.as_ref())
                .await
            {
                Ok(OffloadOutcome::Enqueued) => summary.enqueued += 1,
                Ok(_) => {}
                Err(e) => {
                    // Retried on the next cycle.
                    tracing::warn!(dirname = %job.dirname(), error = %e, "Skipping job this cycle");
                    summary.skipped += 1;
                }
            }
        }
        drop(tx);

        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Offload worker panicked");
            }
        }

        let (removed, reported) = self.update_offload_results();
        summary.removed = removed;
        summary.reported = reported;
        summary.open = self.open_jobs.len();
        Ok(summary)
    }

    /// Drop offloaded jobs and report failures if it is time to.
    ///
    /// Returns how many jobs were dropped and whether a report went out. A
    /// report lists every open job with at least one attempt, but is only
    /// sent when some job is reportable.
    pub fn update_offload_results(&mut self) -> (usize, bool) {
        let before = self.open_jobs.len();
        self.open_jobs.retain(|_, job| !job.is_offloaded());
        let removed = before - self.open_jobs.len();
        tracing::debug!(removed, open = self.open_jobs.len(), "End of offload cycle");

        if !self.open_jobs.values().any(JobDirectory::is_reportable) {
            return (removed, false);
        }
        let failed: Vec<&JobDirectory> = self
            .open_jobs
            .values()
            .filter(|job| job.get_failure_count() > 0)
            .collect();
        tracing::debug!(jobs = failed.len(), "Offload failed for jobs");

        let now = Utc::now();
        if now < self.next_report_time {
            return (removed, false);
        }
        report_offload_failures(
            failed,
            self.notifier.as_ref(),
            self.config.helper_url.as_deref(),
        );
        self.next_report_time = now
            + chrono::Duration::from_std(self.config.report_interval())
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        (removed, true)
    }

    /// Offload until `shutdown` is cancelled. A failed cycle is logged and
    /// retried after the usual pause.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let pause = Duration::from_secs(self.config.sleep_secs);
        loop {
            match self.offload_once().await {
                Ok(summary) => tracing::info!(
                    new_jobs = summary.new_jobs,
                    enqueued = summary.enqueued,
                    removed = summary.removed,
                    open = summary.open,
                    "Offload cycle complete"
                ),
                Err(e) => tracing::error!(error = %e, "Offload cycle failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        tracing::info!(open = self.open_jobs.len(), "Offloader stopped");
    }
}
