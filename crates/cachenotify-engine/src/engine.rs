// ABOUTME: Notification engine lifecycle: one polling task per source plus the flush task
// ABOUTME: Hands out a handle for status snapshots, resync requests and graceful shutdown

use cachenotify_core::{
    EngineConfig, InvalidationService, NotifyError, OrderNumber, Result, SourceId,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::flush::FlushSchedule;
use crate::status::{SourceStatus, StatusBoard};
use crate::worker::{Collaborators, SourceWorker};

/// Runs the polling pipeline for every enabled source.
pub struct NotificationEngine {
    config: EngineConfig,
    deps: Collaborators,
    fetch_limit: Arc<Semaphore>,
    status: StatusBoard,
    started_at: DateTime<Utc>,
}

impl NotificationEngine {
    /// Validates `config` and pins the processing delay for the engine's lifetime.
    pub fn new(mut config: EngineConfig, deps: Collaborators) -> Result<Self> {
        config
            .validate()
            .map_err(|e| NotifyError::Config(format!("{e:#}")))?;
        let delay = config
            .resolve_processing_delay()
            .map_err(|e| NotifyError::Config(format!("{e:#}")))?;
        info!(
            target: "cachenotify::engine",
            delay_secs = delay.as_secs(),
            sources = config.enabled_sources().len(),
            interval_secs = config.poll.interval_secs,
            "notification engine configured"
        );
        let fetch_limit = Arc::new(Semaphore::new(config.poll.max_concurrent_fetches));
        Ok(Self {
            config,
            deps,
            fetch_limit,
            status: StatusBoard::default(),
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status_board(&self) -> StatusBoard {
        self.status.clone()
    }

    /// Builds one worker per enabled source, restored from persisted checkpoints
    /// and loaded with any order numbers an earlier run gave up on.
    pub fn workers(&self) -> Result<Vec<SourceWorker>> {
        let redo: HashMap<String, BTreeSet<OrderNumber>> = match &self.deps.report {
            Some(report) => report.load_and_consume().unwrap_or_else(|e| {
                warn!(error = %e, "could not read unprocessed order report");
                HashMap::new()
            }),
            None => HashMap::new(),
        };

        let mut workers = Vec::new();
        for source in self.config.enabled_sources() {
            let mut worker = SourceWorker::new(
                &source,
                &self.config,
                self.deps.clone(),
                self.fetch_limit.clone(),
                self.status.clone(),
                self.started_at,
            )?;
            worker.restore();
            if let Some(numbers) = redo.get(&worker.source().table_name()) {
                worker.redo(numbers, self.started_at);
            }
            workers.push(worker);
        }
        Ok(workers)
    }

    /// Starts every source task and, when configured, the flush task.
    pub fn spawn(self) -> Result<EngineHandle> {
        let workers = self.workers()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let period = self.config.poll.interval();

        let mut tasks = Vec::new();
        let mut resync_flags = HashMap::new();
        for worker in workers {
            let source = worker.source();
            resync_flags.insert(source, worker.resync_flag());
            let rx = shutdown_rx.clone();
            tasks.push((source.label(), tokio::spawn(worker.run(period, rx))));
        }

        let schedule = FlushSchedule::new(&self.config.flush, Utc::now());
        if !schedule.is_empty() {
            let service = self.deps.service.clone();
            let rx = shutdown_rx.clone();
            tasks.push((
                "flush".to_string(),
                tokio::spawn(run_flush_schedule(schedule, service, period, rx)),
            ));
        }

        info!(
            target: "cachenotify::engine",
            tasks = tasks.len(),
            "notification engine started"
        );
        Ok(EngineHandle {
            shutdown_tx,
            tasks,
            status: self.status,
            resync_flags,
            shutdown_timeout: Duration::from_secs(self.config.shutdown_timeout_secs),
        })
    }
}

/// Sends a `Clear` batch for each cache whose flush interval has elapsed.
pub async fn run_flush_schedule(
    mut schedule: FlushSchedule,
    service: Arc<dyn InvalidationService>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        if let Some(batch) = schedule.due_batch(Utc::now()) {
            let caches: Vec<&str> = batch.requests.iter().map(|r| r.entity.as_str()).collect();
            match service.process(&batch).await {
                Ok(()) => info!(target: "cachenotify::engine", ?caches, "scheduled cache flush sent"),
                Err(e) => warn!(?caches, error = %e, "scheduled cache flush rejected"),
            }
        }
    }
    debug!("flush task stopped");
    Ok(())
}

/// How the tasks ended during shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: usize,
    pub failed: usize,
    pub timed_out: usize,
}

/// Control surface for a running engine.
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
    status: StatusBoard,
    resync_flags: HashMap<SourceId, Arc<AtomicBool>>,
    shutdown_timeout: Duration,
}

impl EngineHandle {
    /// Copy of every source's latest status, ordered by source.
    pub fn status(&self) -> Vec<SourceStatus> {
        let mut statuses: Vec<SourceStatus> = self.status.read().values().cloned().collect();
        statuses.sort_by_key(|s| s.source);
        statuses
    }

    pub fn source_status(&self, source: SourceId) -> Option<SourceStatus> {
        self.status.read().get(&source).cloned()
    }

    /// Forces a resync on the next cycle of one source, or of all when `None`.
    /// Returns how many sources were flagged.
    pub fn request_resync(&self, source: Option<SourceId>) -> usize {
        let mut flagged = 0;
        for (id, flag) in &self.resync_flags {
            if source.map_or(true, |wanted| wanted == *id) {
                flag.store(true, Ordering::SeqCst);
                flagged += 1;
            }
        }
        flagged
    }

    /// Signals every task and waits for them, up to the shutdown timeout overall.
    /// Cycles already running finish first.
    pub async fn shutdown(self) -> ShutdownReport {
        self.shutdown_tx.send_replace(true);
        let deadline = Instant::now() + self.shutdown_timeout;
        let mut report = ShutdownReport::default();

        for (name, mut handle) in self.tasks {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => {
                    debug!(task = %name, "task stopped");
                    report.stopped += 1;
                }
                Ok(Ok(Err(e))) => {
                    warn!(target: "cachenotify::engine", task = %name, error = %e, "task stopped with error");
                    report.failed += 1;
                }
                Ok(Err(join_error)) => {
                    warn!(target: "cachenotify::engine", task = %name, error = %join_error, "task panicked");
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(
                        target: "cachenotify::engine",
                        task = %name,
                        timeout_secs = self.shutdown_timeout.as_secs(),
                        "task did not stop in time, aborting"
                    );
                    handle.abort();
                    report.timed_out += 1;
                }
            }
        }
        info!(target: "cachenotify::engine", ?report, "notification engine stopped");
        report
    }
}
