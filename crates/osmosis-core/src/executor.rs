//! The progress step executor: runs one step's items serially or across
//! worker shards, keeps the status line current, and merges the shards back.

use crate::codec::Codec;
use crate::handler::ItemHandler;
use crate::interrupt::Interrupt;
use crate::queue::{PushOutcome, work_queue};
use crate::stats::ProgressStats;
use crate::status::{DisplayMode, StatusLine};
use crate::step::{Items, Step, StepError};
use crate::store::{Store, StoreError};
use crate::worker::{Launcher, Worker, WorkerReport};
use crossbeam::channel;
use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// One worker per available core.
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    workers: usize,
    queue_capacity: Option<usize>,
    codec: Codec,
    scratch_dir: Option<PathBuf>,
    display: DisplayMode,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: None,
            codec: Codec::default(),
            scratch_dir: None,
            display: DisplayMode::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count (at least one).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the work queue capacity. Defaults to twice the worker count.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity.max(1));
        self
    }

    /// Set the framing used on worker process channels.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Create run directories under `dir` instead of the system temp dir.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn with_display(mut self, display: DisplayMode) -> Self {
        self.display = display;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(self.workers * 2)
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch_dir.as_deref()
    }

    pub fn display(&self) -> DisplayMode {
        self.display
    }

    /// A step with a known total at or below this runs serially.
    pub fn min_parallel_items(&self) -> u64 {
        self.workers as u64 * 10
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Serial,
    Parallel,
}

/// Outcome of one executed step.
#[derive(Debug)]
pub struct StepSummary {
    pub step: String,
    pub title: String,
    pub mode: ExecutionMode,
    pub totals: ProgressStats,
    /// The final status text, as shown on the summary line.
    pub status: String,
    pub duration: Duration,
    /// One report per worker; empty for serial runs.
    pub workers: Vec<WorkerReport>,
}

impl StepSummary {
    /// Items dispatched to workers but never reported back.
    pub fn lost_items(&self) -> u64 {
        self.workers.iter().map(WorkerReport::lost).sum()
    }
}

/// Errors that fail a step.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("{context}: {source}")]
    Setup {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("item source failed: {0}")]
    ItemSource(#[source] StepError),

    #[error("every worker terminated with {undelivered} items never dispatched ({lost} lost in total)")]
    NoLiveWorkers {
        /// Items produced but never taken off the queue by a worker.
        undelivered: u64,
        /// Every produced item that did not report back, `undelivered` included.
        lost: u64,
    },

    #[error("failed to merge shard {}: {source}", shard.display())]
    Merge {
        shard: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("status thread panicked")]
    StatusThread,

    #[error("aborted")]
    Aborted,
}

fn setup<E>(context: impl Into<String>) -> impl FnOnce(E) -> ExecuteError
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    let context = context.into();
    move |e| ExecuteError::Setup {
        context,
        source: e.into(),
    }
}

/// How the producer loop ended.
enum Production {
    Exhausted,
    Interrupted,
    WorkersGone,
    SourceFailed(StepError),
}

/// Runs steps against a main store, choosing serial or parallel execution.
pub struct ProgressStepExecutor {
    config: ExecutorConfig,
    launcher: Arc<dyn Launcher>,
    interrupt: Interrupt,
}

impl ProgressStepExecutor {
    pub fn new(config: ExecutorConfig, launcher: Arc<dyn Launcher>, interrupt: Interrupt) -> Self {
        Self {
            config,
            launcher,
            interrupt,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Parallel only when the step allows it and the item count is unknown
    /// or large enough to amortize worker startup.
    pub fn select_mode(&self, step: &dyn Step, max_progress: Option<u64>) -> ExecutionMode {
        let large_enough = match max_progress {
            None => true,
            Some(total) => total > self.config.min_parallel_items(),
        };
        if step.parallelizable() && large_enough {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Serial
        }
    }

    /// Run every item of `step` against `store`.
    ///
    /// Per-item failures are counted, never returned. The store is released
    /// while workers run and is always reacquired before this returns.
    pub fn execute(
        &self,
        step: &Arc<dyn Step>,
        store: &mut Store,
    ) -> Result<StepSummary, ExecuteError> {
        let started = Instant::now();
        let title = step.title();
        let max_progress = step
            .max_progress()
            .map_err(setup(format!("could not size step {}", step.name())))?;
        let mode = self.select_mode(step.as_ref(), max_progress);
        debug!(step = step.name(), ?mode, ?max_progress, "selected execution mode");

        let items = step
            .items()
            .map_err(setup(format!("could not open items of step {}", step.name())))?;
        let status = StatusLine::new(
            &title,
            max_progress,
            step.report_progress_in_percent(),
            self.config.display,
        );

        let ((totals, status), workers) = match mode {
            ExecutionMode::Serial => (
                self.run_serial(step.as_ref(), store, items, status)?,
                Vec::new(),
            ),
            ExecutionMode::Parallel => self.run_parallel(step, store, items, status)?,
        };

        Ok(StepSummary {
            step: step.name().to_string(),
            title,
            mode,
            totals,
            status,
            duration: started.elapsed(),
            workers,
        })
    }

    fn run_serial(
        &self,
        step: &dyn Step,
        store: &Store,
        items: Items<'_>,
        mut status: StatusLine,
    ) -> Result<(ProgressStats, String), ExecuteError> {
        let mut handler = ItemHandler::new(step, store);
        let mut source_error = None;
        for next in items {
            if self.interrupt.is_raised() {
                status.abandon();
                return Err(ExecuteError::Aborted);
            }
            match next {
                Ok(item) => status.update(&handler.handle(&item)),
                Err(e) => {
                    source_error = Some(e);
                    break;
                }
            }
        }
        if self.interrupt.is_raised() {
            status.abandon();
            return Err(ExecuteError::Aborted);
        }

        let message = status.message();
        let totals = status.finish();
        match source_error {
            Some(e) => Err(ExecuteError::ItemSource(e)),
            None => Ok((totals, message)),
        }
    }

    fn create_run_dir(&self) -> Result<TempDir, ExecuteError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("osmosis-run-");
        let dir = match self.config.scratch_dir() {
            Some(scratch) => {
                std::fs::create_dir_all(scratch)
                    .map_err(setup(format!("could not create {}", scratch.display())))?;
                builder.tempdir_in(scratch)
            }
            None => builder.tempdir(),
        };
        dir.map_err(setup("could not create run directory"))
    }

    /// Create fresh shards and start one execution context per shard.
    fn spawn_workers(
        &self,
        step: &Arc<dyn Step>,
        store: &Store,
        run_dir: &Path,
    ) -> Result<Vec<Worker>, ExecuteError> {
        let mut workers: Vec<Worker> = Vec::with_capacity(self.config.workers);
        for index in 0..self.config.workers {
            let shard = run_dir.join(format!("shard-{index}.db"));
            let spawned = Store::create_fresh(&shard, store.schema().clone())
                .map_err(setup(format!("could not create shard {}", shard.display())))
                .and_then(|shard_store| {
                    drop(shard_store);
                    let mut worker = Worker::new(index, &shard);
                    worker
                        .spawn(self.launcher.as_ref(), step, store.schema(), self.config.codec)
                        .map_err(setup(format!("could not launch worker {index}")))?;
                    Ok(worker)
                });
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    for worker in workers {
                        worker.join();
                    }
                    return Err(e);
                }
            }
        }
        Ok(workers)
    }

    fn run_parallel(
        &self,
        step: &Arc<dyn Step>,
        store: &mut Store,
        items: Items<'_>,
        status: StatusLine,
    ) -> Result<((ProgressStats, String), Vec<WorkerReport>), ExecuteError> {
        let run_dir = self.create_run_dir()?;
        info!(
            step = step.name(),
            workers = self.config.workers,
            launcher = self.launcher.name(),
            dir = %run_dir.path().display(),
            "running step in parallel"
        );

        let (progress_tx, progress_rx) = channel::unbounded::<ProgressStats>();
        let status = status
            .spawn(progress_rx)
            .map_err(setup("could not start status thread"))?;

        if let Err(e) = store.reclaim_memory() {
            debug!("memory reclamation skipped: {e}");
        }
        store.release()?;

        let mut workers = match self.spawn_workers(step, store, run_dir.path()) {
            Ok(workers) => workers,
            Err(e) => {
                drop(progress_tx);
                if let Ok(line) = status.join() {
                    line.abandon();
                }
                store.reacquire()?;
                return Err(e);
            }
        };

        let (producer, consumer) = work_queue(self.config.queue_capacity());
        for worker in &mut workers {
            if let Err(e) = worker.start(consumer.clone(), progress_tx.clone(), self.interrupt.clone()) {
                warn!(worker = worker.index(), "could not start worker: {e}");
            }
        }
        // Pumps hold the only consumers and progress senders from here on.
        drop(consumer);
        drop(progress_tx);

        let mut production = Production::Exhausted;
        // Items handed to the queue, including one refused for lack of consumers.
        let mut produced = 0u64;
        for next in items {
            if self.interrupt.is_raised() {
                production = Production::Interrupted;
                break;
            }
            match next {
                Ok(item) => match producer.push(item, &self.interrupt) {
                    PushOutcome::Queued => produced += 1,
                    PushOutcome::Interrupted => {
                        production = Production::Interrupted;
                        break;
                    }
                    PushOutcome::Disconnected => {
                        produced += 1;
                        production = Production::WorkersGone;
                        break;
                    }
                },
                Err(e) => {
                    production = Production::SourceFailed(e);
                    break;
                }
            }
        }
        producer.close();

        let reacquired = store.reacquire();
        let reports: Vec<WorkerReport> = workers.into_iter().map(Worker::join).collect();
        let status = status.join().map_err(|_| ExecuteError::StatusThread)?;
        reacquired?;

        if matches!(production, Production::Interrupted) || self.interrupt.is_raised() {
            status.abandon();
            let kept = run_dir.keep();
            warn!(dir = %kept.display(), "step aborted; shards left unmerged");
            return Err(ExecuteError::Aborted);
        }

        for report in &reports {
            match store.merge_shard(&report.shard) {
                Ok(rows) => debug!(worker = report.index, rows, "merged shard"),
                Err(source) => {
                    status.abandon();
                    let kept = run_dir.keep();
                    warn!(dir = %kept.display(), "merge failed; remaining shards kept");
                    return Err(ExecuteError::Merge {
                        shard: report.shard.clone(),
                        source,
                    });
                }
            }
        }
        info!(step = step.name(), shards = reports.len(), "merged shards");

        // Items left in the queue when the last consumer went away are
        // dropped with the channel.
        let dispatched: u64 = reports.iter().map(|r| r.dispatched).sum();
        let completed: u64 = reports.iter().map(|r| r.completed).sum();
        let undelivered = produced.saturating_sub(dispatched);

        let message = status.message();
        let totals = status.finish();
        if let Production::SourceFailed(e) = production {
            return Err(ExecuteError::ItemSource(e));
        }
        if undelivered > 0 {
            let lost = produced.saturating_sub(completed);
            warn!(step = step.name(), undelivered, lost, "no live workers left");
            return Err(ExecuteError::NoLiveWorkers { undelivered, lost });
        }
        Ok(((totals, message), reports))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ItemContext;
    use crate::step::Item;
    use crate::store::{LogType, Schema};
    use crate::value::{Record, RecordExt, Value};
    use crate::worker::{LaunchRequest, ThreadLauncher, TransportError, WorkerChannel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Items `0..count` carrying `id` and `units`.
    #[derive(Default)]
    struct Numbers {
        count: i64,
        parallel: bool,
        known_total: bool,
        fail_on: Option<i64>,
        source_fails_after: Option<i64>,
        weighted: bool,
        interrupt_at: Option<(i64, Interrupt)>,
    }

    impl Step for Numbers {
        fn name(&self) -> &str {
            "numbers"
        }

        fn parallelizable(&self) -> bool {
            self.parallel
        }

        fn max_progress(&self) -> Result<Option<u64>, StepError> {
            Ok(self.known_total.then_some(self.count as u64))
        }

        fn items(&self) -> Result<Items<'_>, StepError> {
            let limit = self.source_fails_after;
            Ok(Box::new((0..self.count).map(move |n| {
                if limit == Some(n) {
                    return Err(StepError::failed("source went away"));
                }
                Ok(Item::new(
                    Record::new().with("id", n).with("units", n % 3 + 1),
                ))
            })))
        }

        fn process_item(&self, item: &Item, ctx: &mut ItemContext<'_>) -> Result<(), StepError> {
            let id = item
                .field("id")
                .and_then(Value::as_i64)
                .ok_or_else(|| StepError::MissingField("id".into()))?;
            if let Some((at, interrupt)) = &self.interrupt_at {
                if id == *at {
                    interrupt.raise();
                }
            }
            if self.fail_on == Some(id) {
                return Err(StepError::failed("bad row"));
            }
            if self.weighted {
                let units = item.field("units").and_then(Value::as_i64).unwrap_or(1);
                ctx.set_progress(units as u64);
            }
            ctx.store()
                .put_record("numbers", &id.to_string(), item.payload())?;
            Ok(())
        }
    }

    /// A context that accepts items but never answers.
    struct Dead;

    impl WorkerChannel for Dead {
        fn send(&mut self, _item: Item) -> Result<(), TransportError> {
            Ok(())
        }

        fn recv(&mut self) -> Result<ProgressStats, TransportError> {
            Err(TransportError::Disconnected)
        }

        fn finish(self: Box<Self>) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Launches `healthy` thread workers, then only dead ones.
    struct Failing {
        healthy: usize,
        launched: AtomicUsize,
    }

    impl Failing {
        fn new(healthy: usize) -> Self {
            Self {
                healthy,
                launched: AtomicUsize::new(0),
            }
        }
    }

    impl Launcher for Failing {
        fn launch(&self, request: &LaunchRequest<'_>) -> Result<Box<dyn WorkerChannel>, TransportError> {
            if self.launched.fetch_add(1, Ordering::SeqCst) < self.healthy {
                ThreadLauncher.launch(request)
            } else {
                Ok(Box::new(Dead))
            }
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn failing_executor(workers: usize, healthy: usize, capacity: usize) -> ProgressStepExecutor {
        let config = ExecutorConfig::new()
            .with_workers(workers)
            .with_queue_capacity(capacity)
            .with_display(DisplayMode::Hidden);
        ProgressStepExecutor::new(config, Arc::new(Failing::new(healthy)), Interrupt::new())
    }

    fn executor(workers: usize, interrupt: Interrupt) -> ProgressStepExecutor {
        let config = ExecutorConfig::new()
            .with_workers(workers)
            .with_display(DisplayMode::Hidden);
        ProgressStepExecutor::new(config, Arc::new(ThreadLauncher), interrupt)
    }

    fn main_store(dir: &TempDir) -> Store {
        Store::open(dir.path().join("main.db"), Schema::core()).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = ExecutorConfig::new().with_workers(3);
        assert_eq!(config.queue_capacity(), 6);
        assert_eq!(config.min_parallel_items(), 30);
        assert_eq!(ExecutorConfig::new().with_workers(0).workers(), 1);
        assert_eq!(config.with_queue_capacity(1).queue_capacity(), 1);
    }

    #[test]
    fn test_select_mode_threshold() {
        let exec = executor(4, Interrupt::new());
        let parallel = Numbers {
            parallel: true,
            ..Default::default()
        };
        assert_eq!(exec.select_mode(&parallel, Some(40)), ExecutionMode::Serial);
        assert_eq!(exec.select_mode(&parallel, Some(41)), ExecutionMode::Parallel);
        assert_eq!(exec.select_mode(&parallel, None), ExecutionMode::Parallel);

        let serial = Numbers::default();
        assert_eq!(exec.select_mode(&serial, None), ExecutionMode::Serial);
        assert_eq!(exec.select_mode(&serial, Some(10_000)), ExecutionMode::Serial);
    }

    #[test]
    fn test_parallel_processes_every_item() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = main_store(&dir);
        let step: Arc<dyn Step> = Arc::new(Numbers {
            count: 1000,
            parallel: true,
            known_total: true,
            ..Default::default()
        });

        let summary = executor(4, Interrupt::new()).execute(&step, &mut store).unwrap();

        assert_eq!(summary.mode, ExecutionMode::Parallel);
        assert_eq!(summary.totals.progress, 1000);
        assert_eq!(summary.totals.error_count, 0);
        assert_eq!(summary.status, "Processed: 1000 / 1000");
        assert_eq!(summary.workers.len(), 4);
        assert_eq!(summary.lost_items(), 0);
        assert!(!store.is_released());
        assert_eq!(store.count_records("numbers").unwrap(), 1000);
        for report in &summary.workers {
            assert!(!report.shard.exists());
        }
    }

    #[test]
    fn test_two_shards_merge_without_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = main_store(&dir);
        let step: Arc<dyn Step> = Arc::new(Numbers {
            count: 20,
            parallel: true,
            ..Default::default()
        });

        let summary = executor(2, Interrupt::new()).execute(&step, &mut store).unwrap();
        assert_eq!(summary.mode, ExecutionMode::Parallel);
        assert_eq!(summary.status, "Processed: 20");
        let dispatched: u64 = summary.workers.iter().map(|w| w.dispatched).sum();
        assert_eq!(dispatched, 20);

        let mut keys: Vec<i64> = store
            .record_keys("numbers")
            .unwrap()
            .iter()
            .map(|k| k.parse().unwrap())
            .collect();
        keys.sort();
        assert_eq!(keys, (0..20).collect::<Vec<_>>());
        assert!(summary.workers.iter().all(|w| !w.shard.exists()));
    }

    #[test]
    fn test_small_step_runs_serially() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = main_store(&dir);
        let step: Arc<dyn Step> = Arc::new(Numbers {
            count: 5,
            parallel: true,
            known_total: true,
            ..Default::default()
        });

        let summary = executor(4, Interrupt::new()).execute(&step, &mut store).unwrap();
        assert_eq!(summary.mode, ExecutionMode::Serial);
        assert!(summary.workers.is_empty());
        assert_eq!(store.count_records("numbers").unwrap(), 5);
    }

    #[test]
    fn test_item_failure_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = main_store(&dir);
        let step: Arc<dyn Step> = Arc::new(Numbers {
            count: 10,
            parallel: true,
            fail_on: Some(7),
            ..Default::default()
        });

        let summary = executor(2, Interrupt::new()).execute(&step, &mut store).unwrap();
        assert_eq!(summary.mode, ExecutionMode::Parallel);
        assert_eq!(summary.totals.progress, 10);
        assert_eq!(summary.totals.error_count, 1);
        assert_eq!(summary.status, "Processed: 10 | 1 errors");
        assert_eq!(store.count_records("numbers").unwrap(), 9);

        let errors = store.log_entries(Some(LogType::Error)).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].exception.as_deref(), Some("bad row"));
        assert_eq!(
            errors[0].item.as_ref().and_then(|v| v.as_object()?.get("id")?.as_i64()),
            Some(7)
        );
    }

    #[test]
    fn test_serial_failure_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = main_store(&dir);
        let step: Arc<dyn Step> = Arc::new(Numbers {
            count: 10,
            fail_on: Some(7),
            ..Default::default()
        });

        let summary = executor(2, Interrupt::new()).execute(&step, &mut store).unwrap();
        assert_eq!(summary.mode, ExecutionMode::Serial);
        assert_eq!(summary.totals.error_count, 1);
        assert_eq!(store.count_records("numbers").unwrap(), 9);
        assert_eq!(store.log_entries(Some(LogType::Error)).unwrap().len(), 1);
    }

    #[test]
    fn test_sums_match_across_modes() {
        let weighted = |parallel| Numbers {
            count: 200,
            parallel,
            weighted: true,
            fail_on: Some(3),
            ..Default::default()
        };
        let expected: u64 = (0..200u64).filter(|n| *n != 3).map(|n| n % 3 + 1).sum::<u64>() + 1;

        for parallel in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let mut store = main_store(&dir);
            let step: Arc<dyn Step> = Arc::new(weighted(parallel));
            let summary = executor(3, Interrupt::new()).execute(&step, &mut store).unwrap();
            assert_eq!(summary.totals.progress, expected, "parallel = {parallel}");
            assert_eq!(summary.totals.error_count, 1);
        }
    }

    #[test]
    fn test_item_source_error_keeps_completed_work() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = main_store(&dir);
        let step: Arc<dyn Step> = Arc::new(Numbers {
            count: 100,
            parallel: true,
            source_fails_after: Some(30),
            ..Default::default()
        });

        let err = executor(2, Interrupt::new()).execute(&step, &mut store).unwrap_err();
        assert!(matches!(err, ExecuteError::ItemSource(_)));
        assert!(!store.is_released());
        assert_eq!(store.count_records("numbers").unwrap(), 30);
    }

    #[test]
    fn test_dead_worker_leaves_the_rest_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = main_store(&dir);
        let step: Arc<dyn Step> = Arc::new(Numbers {
            count: 100,
            parallel: true,
            ..Default::default()
        });

        let summary = failing_executor(2, 1, 4).execute(&step, &mut store).unwrap();
        assert_eq!(summary.mode, ExecutionMode::Parallel);
        assert!(!store.is_released());

        // The dead worker loses at most the one item it took.
        let lost = summary.lost_items();
        assert!(lost <= 1);
        assert_eq!(store.count_records("numbers").unwrap() + lost, 100);
        assert_eq!(summary.totals.progress + lost, 100);

        let healthy = &summary.workers[0];
        assert!(healthy.failure.is_none());
        assert!(!healthy.shard.exists());
        let dead = &summary.workers[1];
        assert_eq!(dead.completed, 0);
        assert_eq!(dead.failure.is_some(), dead.dispatched > 0);
    }

    #[test]
    fn test_queued_items_of_dead_workers_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = main_store(&dir);
        let step: Arc<dyn Step> = Arc::new(Numbers {
            count: 6,
            parallel: true,
            ..Default::default()
        });

        // Everything fits in the queue, so production ends normally.
        let err = failing_executor(2, 0, 16).execute(&step, &mut store).unwrap_err();
        match err {
            ExecuteError::NoLiveWorkers { undelivered, lost } => {
                assert_eq!(undelivered, 4);
                assert_eq!(lost, 6);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!store.is_released());
        assert_eq!(store.count_records("numbers").unwrap(), 0);
    }

    #[test]
    fn test_refused_push_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = main_store(&dir);
        let step: Arc<dyn Step> = Arc::new(Numbers {
            count: 500,
            parallel: true,
            ..Default::default()
        });

        let err = failing_executor(2, 0, 1).execute(&step, &mut store).unwrap_err();
        match err {
            ExecuteError::NoLiveWorkers { undelivered, lost } => {
                assert!(undelivered >= 1);
                assert_eq!(lost, undelivered + 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!store.is_released());
    }

    #[test]
    fn test_interrupt_aborts_without_merging() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let mut store = main_store(&dir);
        let interrupt = Interrupt::new();
        let step: Arc<dyn Step> = Arc::new(Numbers {
            count: 1000,
            parallel: true,
            interrupt_at: Some((50, interrupt.clone())),
            ..Default::default()
        });

        let config = ExecutorConfig::new()
            .with_workers(2)
            .with_scratch_dir(&scratch)
            .with_display(DisplayMode::Hidden);
        let exec = ProgressStepExecutor::new(config, Arc::new(ThreadLauncher), interrupt);
        let err = exec.execute(&step, &mut store).unwrap_err();

        assert!(matches!(err, ExecuteError::Aborted));
        assert!(!store.is_released());
        assert_eq!(store.count_records("numbers").unwrap(), 0);

        let run_dirs: Vec<_> = std::fs::read_dir(&scratch).unwrap().collect();
        assert_eq!(run_dirs.len(), 1);
        let run_dir = run_dirs[0].as_ref().unwrap().path();
        assert!(run_dir.join("shard-0.db").exists());
        assert!(run_dir.join("shard-1.db").exists());
    }

    #[test]
    fn test_interrupt_before_serial_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = main_store(&dir);
        let interrupt = Interrupt::new();
        interrupt.raise();
        let step: Arc<dyn Step> = Arc::new(Numbers {
            count: 3,
            ..Default::default()
        });

        let err = executor(1, interrupt).execute(&step, &mut store).unwrap_err();
        assert!(matches!(err, ExecuteError::Aborted));
        assert_eq!(store.count_records("numbers").unwrap(), 0);
    }
}
