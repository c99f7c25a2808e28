//! Converter: an ordered list of steps run against one main store.

use crate::executor::{ExecuteError, ExecutorConfig, ProgressStepExecutor, StepSummary};
use crate::interrupt::Interrupt;
use crate::stats::ProgressStats;
use crate::step::Step;
use crate::store::{Schema, Store, StoreError};
use crate::worker::{Launcher, ThreadLauncher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("could not set up store: {0}")]
    Setup(#[source] StoreError),

    #[error("step {step} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: ExecuteError,
    },

    #[error("Aborted")]
    Aborted,
}

impl RunError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Outcome of a completed run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub steps: Vec<StepSummary>,
    pub duration: Duration,
}

impl RunSummary {
    pub fn totals(&self) -> ProgressStats {
        self.steps.iter().map(|s| s.totals).sum()
    }

    pub fn step(&self, name: &str) -> Option<&StepSummary> {
        self.steps.iter().find(|s| s.step == name)
    }
}

/// Runs its steps in order against one main store.
///
/// Workers run on in-process threads unless another launcher is supplied.
pub struct Converter {
    steps: Vec<Arc<dyn Step>>,
    store_path: PathBuf,
    schema: Schema,
    launcher: Arc<dyn Launcher>,
    config: ExecutorConfig,
    interrupt: Interrupt,
    only: Vec<String>,
    skip: Vec<String>,
}

impl Converter {
    pub fn new(store_path: impl Into<PathBuf>, steps: Vec<Arc<dyn Step>>) -> Self {
        Self {
            steps,
            store_path: store_path.into(),
            schema: Schema::core(),
            launcher: Arc::new(ThreadLauncher),
            config: ExecutorConfig::default(),
            interrupt: Interrupt::new(),
            only: Vec::new(),
            skip: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an interrupt flag, e.g. one raised by a Ctrl-C handler.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Run only the named steps (in their original order).
    pub fn with_only(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.only = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skip(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.skip = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// The steps a run will execute, after `only` and `skip`.
    pub fn selected_steps(&self) -> Vec<Arc<dyn Step>> {
        for name in self.only.iter().chain(&self.skip) {
            if !self.steps.iter().any(|s| s.name() == name) {
                warn!(step = %name, "step filter names an unknown step");
            }
        }
        self.steps
            .iter()
            .filter(|s| self.only.is_empty() || self.only.iter().any(|n| n == s.name()))
            .filter(|s| !self.skip.iter().any(|n| n == s.name()))
            .cloned()
            .collect()
    }

    pub fn run(&self) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let mut store =
            Store::open(&self.store_path, self.schema.clone()).map_err(RunError::Setup)?;
        info!(
            store = %self.store_path.display(),
            version = store.schema_version().unwrap_or(0),
            "opened main store"
        );

        let executor = ProgressStepExecutor::new(
            self.config.clone(),
            Arc::clone(&self.launcher),
            self.interrupt.clone(),
        );

        let mut summary = RunSummary::default();
        for step in self.selected_steps() {
            if self.interrupt.is_raised() {
                return Err(self.aborted());
            }
            info!(step = step.name(), "starting step");
            step.execute(&store).map_err(|e| RunError::Step {
                step: step.name().to_string(),
                source: ExecuteError::Setup {
                    context: "execute hook failed".into(),
                    source: Box::new(e),
                },
            })?;

            match executor.execute(&step, &mut store) {
                Ok(done) => {
                    info!(
                        step = step.name(),
                        status = %done.status,
                        elapsed_ms = done.duration.as_millis() as u64,
                        "finished step"
                    );
                    if done.lost_items() > 0 {
                        warn!(step = step.name(), lost = done.lost_items(), "items lost to worker failures");
                    }
                    summary.steps.push(done);
                }
                Err(ExecuteError::Aborted) => return Err(self.aborted()),
                Err(source) => {
                    return Err(RunError::Step {
                        step: step.name().to_string(),
                        source,
                    });
                }
            }
        }

        summary.duration = started.elapsed();
        Ok(summary)
    }

    /// The terminal message is printed whatever the display mode.
    fn aborted(&self) -> RunError {
        eprintln!("Aborted");
        warn!("run aborted");
        RunError::Aborted
    }
}
