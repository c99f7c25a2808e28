//! Workers: one isolated execution context plus one supervising thread.
//!
//! The supervising thread ("pump") lives in the executor's process. It moves
//! items from the shared work queue into the context's input channel and
//! results from the context's output channel into the progress queue, one
//! item at a time. The context itself is either a child OS process speaking
//! a `Codec` over its stdin/stdout, or an in-process thread; in both cases it
//! holds the only writable handle to its shard.

use crate::codec::{Codec, CodecError};
use crate::handler::ItemHandler;
use crate::interrupt::Interrupt;
use crate::queue::QueueConsumer;
use crate::stats::ProgressStats;
use crate::step::{Item, Step};
use crate::store::{Schema, Store};
use crossbeam::channel::{self, Receiver, Sender};
use std::fmt;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    /// The execution context is running and waiting for input.
    Spawned,
    /// The pump is moving items and results.
    Draining,
    /// The queue is exhausted; waiting for the context to exit.
    Closing,
    /// The context has exited and its channels are closed.
    Joined,
    Closed,
}

/// Failure on a worker's channels. Terminates that worker only.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("worker channel i/o: {0}")]
    Io(#[from] io::Error),

    #[error("worker channel codec: {0}")]
    Codec(#[from] CodecError),

    #[error("worker closed its output channel")]
    Disconnected,

    #[error("worker process exited with {0}")]
    ChildExited(String),

    #[error("could not launch worker: {0}")]
    Launch(String),

    #[error("worker thread panicked")]
    Panicked,
}

/// The executor's end of an execution context's channels.
pub trait WorkerChannel: Send {
    /// Deliver one item to the context.
    fn send(&mut self, item: Item) -> Result<(), TransportError>;

    /// Block until the context reports the outcome of the last item.
    fn recv(&mut self) -> Result<ProgressStats, TransportError>;

    /// Close the input channel and wait for the context to exit.
    fn finish(self: Box<Self>) -> Result<(), TransportError>;
}

/// Creates execution contexts for workers.
pub trait Launcher: Send + Sync {
    /// Start a context that processes items into the (already migrated)
    /// shard named in `request`.
    fn launch(&self, request: &LaunchRequest<'_>) -> Result<Box<dyn WorkerChannel>, TransportError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Everything a launcher needs to start one execution context.
pub struct LaunchRequest<'a> {
    pub step: &'a Arc<dyn Step>,
    pub shard: &'a Path,
    pub schema: &'a Schema,
    pub codec: Codec,
}

/// What a worker process needs to know to serve a shard.
#[derive(Debug, Clone, Copy)]
pub struct WorkerInvocation<'a> {
    pub step: &'a str,
    pub shard: &'a Path,
    pub codec: Codec,
}

type CommandBuilder = dyn Fn(&WorkerInvocation<'_>) -> Command + Send + Sync;

/// Runs each worker as a child OS process.
///
/// The child is expected to call [`serve_worker`] on its stdin/stdout for the
/// step and shard named in the invocation. Its stderr is inherited.
pub struct ProcessLauncher {
    build: Box<CommandBuilder>,
}

impl fmt::Debug for ProcessLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLauncher").finish_non_exhaustive()
    }
}

impl ProcessLauncher {
    pub fn new(build: impl Fn(&WorkerInvocation<'_>) -> Command + Send + Sync + 'static) -> Self {
        Self {
            build: Box::new(build),
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, request: &LaunchRequest<'_>) -> Result<Box<dyn WorkerChannel>, TransportError> {
        let shard = request.shard;
        let invocation = WorkerInvocation {
            step: request.step.name(),
            shard,
            codec: request.codec,
        };
        let mut command = (self.build)(&invocation);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .map_err(|e| TransportError::Launch(e.to_string()))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TransportError::Launch("child pipes unavailable".into()));
        };
        debug!(pid = child.id(), shard = %shard.display(), "spawned worker process");

        Ok(Box::new(ProcessChannel {
            child,
            stdin: Some(BufWriter::new(stdin)),
            stdout: BufReader::new(stdout),
            codec: request.codec,
        }))
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

struct ProcessChannel {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: BufReader<ChildStdout>,
    codec: Codec,
}

impl ProcessChannel {
    /// Prefer the child's exit status over a bare EOF when it has one.
    fn exited_or(&mut self, err: TransportError) -> TransportError {
        match self.child.try_wait() {
            Ok(Some(status)) => TransportError::ChildExited(status.to_string()),
            _ => err,
        }
    }
}

impl WorkerChannel for ProcessChannel {
    fn send(&mut self, item: Item) -> Result<(), TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::Disconnected)?;
        match self.codec.write(stdin, &item) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.exited_or(e.into())),
        }
    }

    fn recv(&mut self) -> Result<ProgressStats, TransportError> {
        match self.codec.read(&mut self.stdout) {
            Ok(Some(stats)) => Ok(stats),
            Ok(None) => Err(self.exited_or(TransportError::Disconnected)),
            Err(e) => Err(self.exited_or(e.into())),
        }
    }

    fn finish(mut self: Box<Self>) -> Result<(), TransportError> {
        if let Some(mut stdin) = self.stdin.take() {
            // The child may already be gone; its exit status says more.
            let _ = stdin.flush();
        }
        let status = self.child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(TransportError::ChildExited(status.to_string()))
        }
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Runs each worker on an in-process thread with its own shard connection.
///
/// Used where spawning processes is not possible (tests, embedding).
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLauncher;

impl Launcher for ThreadLauncher {
    fn launch(&self, request: &LaunchRequest<'_>) -> Result<Box<dyn WorkerChannel>, TransportError> {
        let store = Store::open(request.shard, request.schema.clone())
            .map_err(|e| TransportError::Launch(e.to_string()))?;
        let (item_tx, item_rx) = channel::bounded::<Item>(1);
        let (result_tx, result_rx) = channel::bounded::<ProgressStats>(1);
        let step = Arc::clone(request.step);

        let handle = thread::Builder::new()
            .name(format!("osmosis-shard-{}", step.name()))
            .spawn(move || {
                let mut handler = ItemHandler::new(step.as_ref(), &store);
                for item in item_rx {
                    if result_tx.send(handler.handle(&item)).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Box::new(ThreadChannel {
            items: Some(item_tx),
            results: result_rx,
            handle: Some(handle),
        }))
    }

    fn name(&self) -> &'static str {
        "thread"
    }
}

struct ThreadChannel {
    items: Option<Sender<Item>>,
    results: Receiver<ProgressStats>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerChannel for ThreadChannel {
    fn send(&mut self, item: Item) -> Result<(), TransportError> {
        self.items
            .as_ref()
            .ok_or(TransportError::Disconnected)?
            .send(item)
            .map_err(|_| TransportError::Disconnected)
    }

    fn recv(&mut self) -> Result<ProgressStats, TransportError> {
        self.results.recv().map_err(|_| TransportError::Disconnected)
    }

    fn finish(mut self: Box<Self>) -> Result<(), TransportError> {
        self.items.take();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| TransportError::Panicked),
            None => Ok(()),
        }
    }
}

/// Final account of one worker, returned by [`Worker::join`].
#[derive(Debug)]
pub struct WorkerReport {
    pub index: usize,
    pub shard: PathBuf,
    /// Items taken from the work queue.
    pub dispatched: u64,
    /// Results received back. Less than `dispatched` only after a failure.
    pub completed: u64,
    pub state: WorkerState,
    pub failure: Option<TransportError>,
}

impl WorkerReport {
    /// Items that were dispatched but never reported (lost for the run).
    pub fn lost(&self) -> u64 {
        self.dispatched - self.completed
    }
}

struct PumpOutcome {
    dispatched: u64,
    completed: u64,
    failure: Option<TransportError>,
}

/// A worker: one execution context, one shard, one supervising thread.
pub struct Worker {
    index: usize,
    shard: PathBuf,
    state: Arc<Mutex<WorkerState>>,
    channel: Option<Box<dyn WorkerChannel>>,
    pump: Option<JoinHandle<PumpOutcome>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("shard", &self.shard)
            .field("state", &self.state())
            .finish()
    }
}

impl Worker {
    pub fn new(index: usize, shard: impl Into<PathBuf>) -> Self {
        Self {
            index,
            shard: shard.into(),
            state: Arc::new(Mutex::new(WorkerState::Created)),
            channel: None,
            pump: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: WorkerState) {
        set_state(&self.state, self.index, state);
    }

    /// Start the execution context. The shard must already be migrated.
    pub fn spawn(
        &mut self,
        launcher: &dyn Launcher,
        step: &Arc<dyn Step>,
        schema: &Schema,
        codec: Codec,
    ) -> Result<(), TransportError> {
        let channel = launcher.launch(&LaunchRequest {
            step,
            shard: &self.shard,
            schema,
            codec,
        })?;
        self.channel = Some(channel);
        self.set_state(WorkerState::Spawned);
        Ok(())
    }

    /// Start the supervising thread.
    ///
    /// The pump stops when the queue is closed and drained, when `interrupt`
    /// is raised, or on the first channel failure. An item in flight when a
    /// failure happens is not requeued.
    pub fn start(
        &mut self,
        work: QueueConsumer,
        progress: Sender<ProgressStats>,
        interrupt: Interrupt,
    ) -> Result<(), TransportError> {
        let mut channel = self.channel.take().ok_or(TransportError::Disconnected)?;
        let state = Arc::clone(&self.state);
        let index = self.index;

        let pump = thread::Builder::new()
            .name(format!("osmosis-worker-{index}"))
            .spawn(move || {
                set_state(&state, index, WorkerState::Draining);
                let mut outcome = PumpOutcome {
                    dispatched: 0,
                    completed: 0,
                    failure: None,
                };

                while !interrupt.is_raised() {
                    let Some(item) = work.pop() else { break };
                    outcome.dispatched += 1;
                    let result = channel.send(item).and_then(|()| channel.recv());
                    match result {
                        Ok(stats) => {
                            outcome.completed += 1;
                            // The status thread outlives every pump.
                            let _ = progress.send(stats);
                        }
                        Err(e) => {
                            outcome.failure = Some(e);
                            break;
                        }
                    }
                }
                drop(progress);

                set_state(&state, index, WorkerState::Closing);
                if let Err(e) = channel.finish() {
                    outcome.failure.get_or_insert(e);
                }
                outcome
            })?;

        self.pump = Some(pump);
        Ok(())
    }

    /// Wait for the supervising thread and the context to finish.
    pub fn join(mut self) -> WorkerReport {
        let outcome = match self.pump.take() {
            Some(pump) => pump.join().unwrap_or(PumpOutcome {
                dispatched: 0,
                completed: 0,
                failure: Some(TransportError::Panicked),
            }),
            None => {
                // Spawned but never started: just close the context.
                let failure = self.channel.take().and_then(|c| c.finish().err());
                PumpOutcome {
                    dispatched: 0,
                    completed: 0,
                    failure,
                }
            }
        };
        self.set_state(WorkerState::Joined);

        if let Some(failure) = &outcome.failure {
            warn!(
                worker = self.index,
                lost = outcome.dispatched - outcome.completed,
                "worker terminated: {failure}"
            );
        }

        self.set_state(WorkerState::Closed);
        WorkerReport {
            index: self.index,
            shard: self.shard.clone(),
            dispatched: outcome.dispatched,
            completed: outcome.completed,
            state: WorkerState::Closed,
            failure: outcome.failure,
        }
    }
}

fn set_state(state: &Mutex<WorkerState>, index: usize, next: WorkerState) {
    let mut current = state.lock().unwrap_or_else(|e| e.into_inner());
    debug!(worker = index, from = ?*current, to = ?next, "worker state");
    *current = next;
}

/// Serve a worker's input stream: the child-process side of [`ProcessLauncher`].
///
/// Reads items until a clean end of input, processes each against `store`
/// and writes back one `ProgressStats` per item. Returns the number of items
/// served.
pub fn serve_worker<R: BufRead, W: Write>(
    step: &dyn Step,
    store: &Store,
    codec: Codec,
    mut input: R,
    mut output: W,
) -> Result<u64, TransportError> {
    let mut handler = ItemHandler::new(step, store);
    let mut served = 0u64;
    while let Some(item) = codec.read::<_, Item>(&mut input)? {
        let stats = handler.handle(&item);
        codec.write(&mut output, &stats)?;
        served += 1;
    }
    Ok(served)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ItemContext;
    use crate::queue::work_queue;
    use crate::step::StepError;
    use crate::value::{Record, RecordExt, Value};
    use std::io::Cursor;

    struct Posts;

    impl Step for Posts {
        fn name(&self) -> &str {
            "posts"
        }

        fn process_item(&self, item: &Item, ctx: &mut ItemContext<'_>) -> Result<(), StepError> {
            let id = item
                .field("id")
                .and_then(Value::as_key)
                .ok_or_else(|| StepError::MissingField("id".into()))?;
            ctx.store().put_record("posts", &id, item.payload())?;
            Ok(())
        }
    }

    fn post(id: i64) -> Item {
        Item::new(Record::new().with("id", id))
    }

    /// A channel that accepts `ok` items and then breaks.
    struct Flaky {
        ok: u64,
        seen: u64,
    }

    impl WorkerChannel for Flaky {
        fn send(&mut self, _item: Item) -> Result<(), TransportError> {
            self.seen += 1;
            Ok(())
        }

        fn recv(&mut self) -> Result<ProgressStats, TransportError> {
            if self.seen > self.ok {
                Err(TransportError::Disconnected)
            } else {
                Ok(ProgressStats::default())
            }
        }

        fn finish(self: Box<Self>) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct FlakyLauncher;

    impl Launcher for FlakyLauncher {
        fn launch(&self, _request: &LaunchRequest<'_>) -> Result<Box<dyn WorkerChannel>, TransportError> {
            Ok(Box::new(Flaky { ok: 2, seen: 0 }))
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[test]
    fn test_serve_worker_over_byte_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("shard-0.db"), Schema::core()).unwrap();

        let mut input = Vec::new();
        for id in 1..=3 {
            Codec::MsgPack.write(&mut input, &post(id)).unwrap();
        }
        Codec::MsgPack
            .write(&mut input, &Item::new(Record::new().with("title", "no id")))
            .unwrap();

        let mut output = Vec::new();
        let served =
            serve_worker(&Posts, &store, Codec::MsgPack, Cursor::new(input), &mut output).unwrap();
        assert_eq!(served, 4);

        let mut reader = Cursor::new(output);
        let mut total = ProgressStats::zero();
        while let Some(stats) = Codec::MsgPack.read::<_, ProgressStats>(&mut reader).unwrap() {
            total += stats;
        }
        assert_eq!(total.progress, 4);
        assert_eq!(total.error_count, 1);
        assert_eq!(store.count_records("posts").unwrap(), 3);
    }

    #[test]
    fn test_thread_worker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let shard = dir.path().join("shard-0.db");
        Store::create_fresh(&shard, Schema::core()).unwrap();

        let step: Arc<dyn Step> = Arc::new(Posts);
        let mut worker = Worker::new(0, &shard);
        assert_eq!(worker.state(), WorkerState::Created);
        worker.spawn(&ThreadLauncher, &step, &Schema::core(), Codec::MsgPack).unwrap();
        assert_eq!(worker.state(), WorkerState::Spawned);

        let (producer, consumer) = work_queue(4);
        let (progress_tx, progress_rx) = channel::unbounded();
        worker
            .start(consumer, progress_tx, Interrupt::new())
            .unwrap();

        let interrupt = Interrupt::new();
        for id in 0..10 {
            producer.push(post(id), &interrupt);
        }
        producer.close();

        let report = worker.join();
        assert!(report.failure.is_none());
        assert_eq!(report.dispatched, 10);
        assert_eq!(report.completed, 10);
        assert_eq!(report.state, WorkerState::Closed);

        let total: ProgressStats = progress_rx.iter().sum();
        assert_eq!(total.progress, 10);

        let shard_store = Store::open(&shard, Schema::core()).unwrap();
        assert_eq!(shard_store.count_records("posts").unwrap(), 10);
    }

    #[test]
    fn test_transport_failure_stops_only_that_worker() {
        let dir = tempfile::tempdir().unwrap();
        let step: Arc<dyn Step> = Arc::new(Posts);

        let mut worker = Worker::new(3, dir.path().join("unused.db"));
        worker.spawn(&FlakyLauncher, &step, &Schema::core(), Codec::MsgPack).unwrap();

        let (producer, consumer) = work_queue(8);
        let (progress_tx, progress_rx) = channel::unbounded();
        worker
            .start(consumer.clone(), progress_tx, Interrupt::new())
            .unwrap();

        let interrupt = Interrupt::new();
        for id in 0..5 {
            producer.push(post(id), &interrupt);
        }
        producer.close();

        let report = worker.join();
        assert!(matches!(report.failure, Some(TransportError::Disconnected)));
        assert_eq!(report.completed, 2);
        assert_eq!(report.lost(), 1);
        assert_eq!(progress_rx.iter().count(), 2);
        // Undispatched items stay in the queue for other workers.
        assert_eq!(consumer.len(), 2);
    }

    #[test]
    fn test_interrupted_worker_stops_dispatching() {
        let dir = tempfile::tempdir().unwrap();
        let shard = dir.path().join("shard-0.db");
        Store::create_fresh(&shard, Schema::core()).unwrap();
        let step: Arc<dyn Step> = Arc::new(Posts);

        let (producer, consumer) = work_queue(8);
        let interrupt = Interrupt::new();
        for id in 0..5 {
            producer.push(post(id), &interrupt);
        }
        interrupt.raise();

        let mut worker = Worker::new(0, &shard);
        worker.spawn(&ThreadLauncher, &step, &Schema::core(), Codec::MsgPack).unwrap();
        let (progress_tx, _progress_rx) = channel::unbounded();
        worker.start(consumer, progress_tx, interrupt).unwrap();

        let report = worker.join();
        assert_eq!(report.dispatched, 0);
        assert!(report.failure.is_none());
        drop(producer);
    }
}
