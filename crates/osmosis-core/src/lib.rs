//! Osmosis: batch migration execution engine
//!
//! Osmosis runs an ordered list of conversion steps over large item streams
//! and writes normalized output into an SQLite store. Parallelizable steps
//! fan out across worker processes, each writing its own shard, and the
//! shards are merged back into the main store when the step ends.

mod codec;
mod converter;
mod executor;
mod handler;
mod interrupt;
mod queue;
mod stats;
mod status;
mod step;
mod store;
mod value;
mod worker;

pub use codec::{Codec, CodecError};
pub use converter::{Converter, RunError, RunSummary};
pub use executor::{
    ExecuteError, ExecutionMode, ExecutorConfig, ProgressStepExecutor, StepSummary,
};
pub use handler::{ItemContext, ItemHandler};
pub use interrupt::Interrupt;
pub use queue::{PushOutcome, QueueConsumer, QueueProducer, work_queue};
pub use stats::ProgressStats;
pub use status::{DisplayMode, StatusLine, format_status};
pub use step::{Item, Items, Step, StepError};
pub use store::{
    LogEntry, LogType, Migration, Schema, Store, StoreError, remove_store_files,
};
pub use value::{Record, RecordExt, Value};
pub use worker::{
    LaunchRequest, Launcher, ProcessLauncher, ThreadLauncher, TransportError, Worker,
    WorkerChannel, WorkerInvocation, WorkerReport, WorkerState, serve_worker,
};
