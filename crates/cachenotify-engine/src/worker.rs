// ABOUTME: Per-source polling state and the poll → filter → recover → dispatch cycle
// ABOUTME: A cycle is staged on copies and applied only after the batch is accepted

use cachenotify_core::{
    ChangeEvent, Checkpoint, CheckpointStore, ControlFilter, CutoffWindow, EngineConfig,
    EventStore, Heartbeat, InvalidationBatch, InvalidationService, LivenessSink, NotifyError,
    OrderNumber, PersistedCheckpoint, Result, SourceConfig, SourceId,
};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::cutoff::CutoffWindowManager;
use crate::dedup::IntervalDedupWindow;
use crate::dispatcher::ChangeEventDispatcher;
use crate::health::HealthMonitor;
use crate::poller::{NotificationPoller, PollStrategy};
use crate::recovery::{MissingOrder, MissingOrderRecovery, MissingOrderSet};
use crate::report::UnprocessedOrderReport;
use crate::status::{CycleMetrics, CycleStage, SourceStatus, StatusBoard};

/// External collaborators shared by every source task.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn EventStore>,
    pub service: Arc<dyn InvalidationService>,
    pub control: Arc<dyn ControlFilter>,
    pub liveness: Arc<dyn LivenessSink>,
    pub checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub report: Option<Arc<UnprocessedOrderReport>>,
}

impl Collaborators {
    /// Allows every entity and drops heartbeats until told otherwise.
    pub fn new(store: Arc<dyn EventStore>, service: Arc<dyn InvalidationService>) -> Self {
        Self {
            store,
            service,
            control: Arc::new(cachenotify_core::AllowAll),
            liveness: Arc::new(crate::liveness::NoopLivenessSink),
            checkpoints: None,
            report: None,
        }
    }

    pub fn with_control(mut self, control: Arc<dyn ControlFilter>) -> Self {
        self.control = control;
        self
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn LivenessSink>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_report(mut self, report: Arc<UnprocessedOrderReport>) -> Self {
        self.report = Some(report);
        self
    }
}

/// Everything one source remembers between cycles. Owned by the source's task.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub checkpoint: Checkpoint,
    /// Window of the last committed cycle.
    pub window: Option<CutoffWindow>,
    /// Start point for the first window, from a persisted checkpoint.
    pub resume_from: Option<DateTime<Utc>>,
    pub dedup: IntervalDedupWindow,
    pub missing: MissingOrderSet,
    pub health: HealthMonitor,
    pub metrics: CycleMetrics,
    pub resync_pending: bool,
    /// Whether the checkpoint's sequence id is meaningful yet.
    pub seeded: bool,
}

/// What a committed cycle did.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub batch: InvalidationBatch,
    pub window: CutoffWindow,
    pub suppressed: usize,
    pub filtered: usize,
    pub recovered: usize,
    pub new_gaps: usize,
    pub abandoned: Vec<OrderNumber>,
    pub resync_requested: bool,
}

/// Cycle result computed without touching `EngineState`.
struct StagedCycle {
    window: CutoffWindow,
    checkpoint: Checkpoint,
    dedup: IntervalDedupWindow,
    missing: MissingOrderSet,
    batch: InvalidationBatch,
    suppressed: usize,
    filtered: usize,
    recovered: usize,
    new_gaps: usize,
    abandoned: Vec<MissingOrder>,
    resync_requested: bool,
}

pub struct SourceWorker {
    source: SourceId,
    windows: CutoffWindowManager,
    poller: NotificationPoller,
    recovery: MissingOrderRecovery,
    recovery_enabled: bool,
    dispatcher: ChangeEventDispatcher,
    deps: Collaborators,
    status: StatusBoard,
    resync_requested: Arc<AtomicBool>,
    state: EngineState,
}

impl SourceWorker {
    /// `config` must already carry a resolved processing delay.
    pub fn new(
        source: &SourceConfig,
        config: &EngineConfig,
        deps: Collaborators,
        fetch_limit: Arc<Semaphore>,
        status: StatusBoard,
        started_at: DateTime<Utc>,
    ) -> Result<Self> {
        let delay = config.processing_delay().ok_or_else(|| {
            NotifyError::Config("processing delay has not been resolved".to_string())
        })?;
        let origin = config
            .resync
            .resolved_origin()
            .map_err(|e| NotifyError::Config(format!("{e:#}")))?;
        let windows = CutoffWindowManager::new(delay, origin, started_at)?;

        let strategy = PollStrategy::from_kind(
            config.strategy_for(source),
            config.poll.effective_scan_window_hours(),
        );
        let poller = NotificationPoller::new(
            deps.store.clone(),
            fetch_limit.clone(),
            strategy,
            config.poll.size,
        );
        let recovery = MissingOrderRecovery::new(
            deps.store.clone(),
            fetch_limit,
            config.recovery.clone(),
        );
        let dispatcher = ChangeEventDispatcher::new(deps.service.clone());
        let source_id = source.source_id();

        status
            .write()
            .insert(source_id, SourceStatus::new(source_id));

        Ok(Self {
            source: source_id,
            windows,
            poller,
            recovery,
            recovery_enabled: config.recovery.enabled,
            dispatcher,
            deps,
            status,
            resync_requested: Arc::new(AtomicBool::new(false)),
            state: EngineState {
                checkpoint: Checkpoint::default(),
                window: None,
                resume_from: None,
                dedup: IntervalDedupWindow::new(config.dedup.clone()),
                missing: MissingOrderSet::new(),
                health: HealthMonitor::new(&config.liveness),
                metrics: CycleMetrics::default(),
                resync_pending: false,
                seeded: strategy != PollStrategy::SequenceId,
            },
        })
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Flag another task can raise to force a resync on the next cycle.
    pub fn resync_flag(&self) -> Arc<AtomicBool> {
        self.resync_requested.clone()
    }

    /// Resumes from a persisted checkpoint, if the store has a fresh one.
    pub fn restore(&mut self) {
        let Some(store) = &self.deps.checkpoints else {
            return;
        };
        match store.load(self.source) {
            Ok(Some(persisted)) => {
                self.state.checkpoint = persisted.checkpoint;
                self.state.resume_from = Some(persisted.window.cutoff);
                self.state.seeded = true;
                self.publish(CycleStage::Idle, None);
            }
            Ok(None) => {}
            Err(e) => warn!(source = %self.source, error = %e, "could not load checkpoint"),
        }
    }

    /// Queues order numbers left over from a previous run for recovery.
    pub fn redo(&mut self, order_numbers: &BTreeSet<OrderNumber>, now: DateTime<Utc>) {
        for &n in order_numbers {
            self.state.missing.insert(n, now);
        }
        if !order_numbers.is_empty() {
            info!(
                source = %self.source,
                count = order_numbers.len(),
                "redoing unprocessed order numbers"
            );
        }
    }

    /// Runs one cycle at `now`. On error nothing but health and metrics changes.
    #[instrument(skip(self), fields(source = %self.source))]
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        if self.resync_requested.swap(false, Ordering::SeqCst) {
            info!(source = %self.source, "resync requested");
            self.state.resync_pending = true;
        }
        let started = Instant::now();
        let result = match self.stage_and_commit(now).await {
            Ok(staged) => Ok(self.apply(staged, now)),
            Err(e) => {
                self.fail(&e, now);
                Err(e)
            }
        };
        histogram!("cachenotify_cycle_duration", "source" => self.source.label())
            .record(started.elapsed());
        result
    }

    async fn stage_and_commit(&self, now: DateTime<Utc>) -> Result<StagedCycle> {
        let state = &self.state;
        let table = self.source.table_name();

        self.set_stage(CycleStage::Polling);
        let window = match &state.window {
            None => self.windows.initial_window(state.resume_from, now),
            Some(previous) => self
                .windows
                .next_window(previous, state.resync_pending, now),
        };
        let mut checkpoint = state.checkpoint.clone();
        if !state.seeded {
            let seed = self
                .poller
                .seed_sequence(self.source, window.prior_cutoff)
                .await?
                .unwrap_or_default();
            debug!(source = %self.source, seed, "sequence checkpoint seeded");
            checkpoint.last_sequence_id = seed;
        } else if state.resync_pending && self.poller.strategy() == PollStrategy::SequenceId {
            // Rewind only; rows already delivered are caught by dedup and last-seen.
            let seed = self
                .poller
                .seed_sequence(self.source, window.prior_cutoff)
                .await?
                .unwrap_or_default();
            let rewound = seed.min(checkpoint.last_sequence_id);
            info!(
                source = %self.source,
                from = checkpoint.last_sequence_id,
                to = rewound,
                "sequence checkpoint rewound for resync"
            );
            checkpoint.last_sequence_id = rewound;
        }
        let page = self
            .poller
            .poll(self.source, &checkpoint, &window, now)
            .await?;

        self.set_stage(CycleStage::Deduping);
        let mut kept = Vec::with_capacity(page.events.len());
        let mut suppressed = 0;
        let mut filtered = 0;
        for event in &page.events {
            if !self.entity_in_use(&event.entity) {
                filtered += 1;
            } else if state.checkpoint.was_last_seen(&event.entity, event.order_number)
                || state.dedup.seen(&table, event.order_number)
            {
                suppressed += 1;
            } else {
                kept.push(event.clone());
            }
        }

        self.set_stage(CycleStage::RecoveringGaps);
        let mut missing = state.missing.clone();
        let mut recovered_events = Vec::new();
        let mut new_gaps = 0;
        let mut abandoned = Vec::new();
        let mut resync_requested = false;
        if self.recovery_enabled {
            for event in &page.events {
                missing.resolve(event.order_number);
            }
            // Only numbers tracked before this cycle are looked up; fresh gaps wait a cycle.
            let candidates = self.recovery.refetch_candidates(&missing);

            // Before the first mark exists, rows older than the window only set the
            // baseline; their spacing says nothing about missing numbers.
            let observed: BTreeSet<OrderNumber> = if missing.high_water().is_none() {
                let (fresh, earlier): (Vec<&ChangeEvent>, Vec<&ChangeEvent>) = page
                    .events
                    .iter()
                    .partition(|e| e.observed_at > window.prior_cutoff);
                if let Some(baseline) = earlier.iter().map(|e| e.order_number).max() {
                    missing.raise_high_water(baseline);
                }
                fresh.iter().map(|e| e.order_number).collect()
            } else {
                page.events.iter().map(|e| e.order_number).collect()
            };
            let scan = self.recovery.find_gaps(&missing, &observed);
            for &gap in &scan.gaps {
                missing.insert(gap, now);
            }
            if let Some(high) = scan.high_water {
                missing.raise_high_water(high);
            }
            new_gaps = scan.gaps.len();
            for (from, to) in &scan.oversized {
                warn!(
                    source = %self.source,
                    from,
                    to,
                    "order number gap too wide to track, requesting resync"
                );
                resync_requested = true;
            }

            if !candidates.is_empty() {
                let rows = self.recovery.refetch(self.source, &candidates).await?;
                let found: BTreeSet<OrderNumber> = rows.iter().map(|e| e.order_number).collect();
                for &n in &candidates {
                    if found.contains(&n) {
                        missing.resolve(n);
                    } else {
                        missing.record_attempt(n);
                    }
                }
                for event in rows {
                    if !candidates.contains(&event.order_number) {
                        continue;
                    }
                    if !self.entity_in_use(&event.entity) {
                        filtered += 1;
                    } else if state.dedup.seen(&table, event.order_number) {
                        suppressed += 1;
                    } else {
                        recovered_events.push(event);
                    }
                }
            }
            abandoned = missing.take_exhausted(self.recovery.config().max_retries);
        }
        let recovered = recovered_events.len();

        self.set_stage(CycleStage::Dispatching);
        let mut events = kept;
        events.extend(recovered_events.iter().cloned());
        events.sort_by(|a, b| {
            a.entity
                .cmp(&b.entity)
                .then(a.sequence_id.cmp(&b.sequence_id))
        });
        let batch = self.dispatcher.dispatch(self.source, &events);
        self.dispatcher.commit(&batch).await?;

        checkpoint.last_sequence_id = page.last_sequence_id;
        let mut seen_now: BTreeMap<String, BTreeSet<OrderNumber>> = BTreeMap::new();
        for event in &page.events {
            seen_now
                .entry(event.entity.clone())
                .or_default()
                .insert(event.order_number);
        }
        checkpoint.last_order_numbers_seen.extend(seen_now);

        let mut dedup = state.dedup.clone();
        for event in page.events.iter().chain(recovered_events.iter()) {
            dedup.record(&table, event.order_number);
        }
        dedup.tick(&table);

        Ok(StagedCycle {
            window,
            checkpoint,
            dedup,
            missing,
            batch,
            suppressed,
            filtered,
            recovered,
            new_gaps,
            abandoned,
            resync_requested,
        })
    }

    fn apply(&mut self, staged: StagedCycle, now: DateTime<Utc>) -> CycleOutcome {
        let label = self.source.label();
        let abandoned: Vec<OrderNumber> =
            staged.abandoned.iter().map(|m| m.order_number).collect();

        self.state.checkpoint = staged.checkpoint;
        self.state.window = Some(staged.window);
        self.state.dedup = staged.dedup;
        self.state.missing = staged.missing;
        self.state.resync_pending = staged.resync_requested;
        self.state.seeded = true;
        self.state.health.record_success();
        self.state.metrics.record_commit(
            staged.batch.len() as u64,
            staged.suppressed as u64,
            staged.filtered as u64,
            staged.recovered as u64,
            now,
        );
        self.state.metrics.orders_abandoned += abandoned.len() as u64;

        counter!("cachenotify_events_dispatched", "source" => label.clone())
            .increment(staged.batch.len() as u64);
        counter!("cachenotify_events_suppressed", "source" => label.clone())
            .increment(staged.suppressed as u64);
        gauge!("cachenotify_missing_orders", "source" => label)
            .set(self.state.missing.len() as f64);

        if !abandoned.is_empty() {
            warn!(
                target: "cachenotify::engine",
                source = %self.source,
                order_numbers = ?abandoned,
                "giving up on missing order numbers"
            );
            if let Some(report) = &self.deps.report {
                if let Err(e) = report.append(self.source, &abandoned) {
                    warn!(source = %self.source, error = %e, "could not write unprocessed order report");
                }
            }
        }

        if let Some(store) = &self.deps.checkpoints {
            let persisted = PersistedCheckpoint {
                source: self.source,
                checkpoint: self.state.checkpoint.clone(),
                window: staged.window,
                saved_at: now,
            };
            if let Err(e) = store.save(&persisted) {
                warn!(source = %self.source, error = %e, "could not persist checkpoint");
            }
        }

        info!(
            target: "cachenotify::engine",
            source = %self.source,
            requests = staged.batch.len(),
            suppressed = staged.suppressed,
            filtered = staged.filtered,
            recovered = staged.recovered,
            new_gaps = staged.new_gaps,
            missing = self.state.missing.len(),
            last_sequence_id = self.state.checkpoint.last_sequence_id,
            "cycle committed"
        );

        self.heartbeat(now);
        self.publish(CycleStage::Idle, None);

        CycleOutcome {
            batch: staged.batch,
            window: staged.window,
            suppressed: staged.suppressed,
            filtered: staged.filtered,
            recovered: staged.recovered,
            new_gaps: staged.new_gaps,
            abandoned,
            resync_requested: staged.resync_requested,
        }
    }

    fn fail(&mut self, err: &NotifyError, now: DateTime<Utc>) {
        self.state.health.record_failure();
        self.state.metrics.record_failure();
        counter!("cachenotify_cycle_failures", "source" => self.source.label()).increment(1);
        warn!(
            target: "cachenotify::engine",
            source = %self.source,
            error = %err,
            consecutive_failures = self.state.health.consecutive_failures(),
            "cycle failed, state unchanged"
        );
        self.heartbeat(now);
        let stage = if err.is_fatal() {
            CycleStage::Failed
        } else {
            CycleStage::Idle
        };
        self.publish(stage, Some(err.to_string()));
    }

    fn entity_in_use(&self, entity: &str) -> bool {
        match self.deps.control.in_use(entity) {
            Ok(in_use) => in_use,
            Err(e) => {
                debug!(source = %self.source, entity, error = %e, "control filter unavailable, keeping entity");
                true
            }
        }
    }

    fn heartbeat(&self, now: DateTime<Utc>) {
        self.deps.liveness.heartbeat(&Heartbeat {
            source: self.source,
            at: now,
            degraded: self.state.health.is_degraded(),
            consecutive_failures: self.state.health.consecutive_failures(),
        });
    }

    fn set_stage(&self, stage: CycleStage) {
        let mut board = self.status.write();
        let status = board
            .entry(self.source)
            .or_insert_with(|| SourceStatus::new(self.source));
        status.stage = stage;
        status.updated_at = Utc::now();
    }

    fn publish(&self, stage: CycleStage, last_error: Option<String>) {
        let status = SourceStatus {
            source: self.source,
            stage,
            health: self.state.health.state(),
            checkpoint: self.state.checkpoint.clone(),
            window: self.state.window,
            missing_orders: self.state.missing.len(),
            dedup: self.state.dedup.snapshot(),
            metrics: self.state.metrics.clone(),
            last_error,
            updated_at: Utc::now(),
        };
        self.status.write().insert(self.source, status);
    }

    /// Polls every `period` until `shutdown` flips to true.
    ///
    /// A cycle that has started always finishes before the signal is looked at
    /// again. Returns an error only when a cycle hits a configuration problem.
    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target: "cachenotify::engine", source = %self.source, "source task started");

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

            if let Err(e) = self.run_cycle(Utc::now()).await {
                if e.is_fatal() {
                    error!(
                        target: "cachenotify::engine",
                        source = %self.source,
                        error = %e,
                        "source task stopping on configuration error"
                    );
                    return Err(e);
                }
            }
        }

        self.publish(CycleStage::Stopped, None);
        info!(target: "cachenotify::engine", source = %self.source, "source task stopped");
        Ok(())
    }
}
