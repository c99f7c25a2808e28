//! Osmosis CLI - batch migration runner

mod config;
mod steps;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use config::Config;
use rhi_osmosis_core::{
    Codec, Converter, DisplayMode, ExecutorConfig, Interrupt, ProcessLauncher, RunError, Schema,
    Store, serve_worker,
};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a tracing filter directive.
const LOG_ENV: &str = "OSMOSIS_LOG";

/// Output verbosity level.
#[derive(Clone, Copy)]
enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    fn from_flags(verbose: bool, quiet: bool) -> Self {
        if quiet {
            Verbosity::Quiet
        } else if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    fn info(self, msg: &str) {
        if !matches!(self, Verbosity::Quiet) {
            println!("{msg}");
        }
    }

    fn debug(self, msg: &str) {
        if matches!(self, Verbosity::Verbose) {
            println!("[debug] {msg}");
        }
    }

    fn result(self, msg: &str) {
        if !matches!(self, Verbosity::Quiet) {
            println!("{msg}");
        }
    }

    fn default_filter(self) -> &'static str {
        match self {
            Verbosity::Quiet => "osmosis=warn,rhi_osmosis_core=warn",
            Verbosity::Normal => "osmosis=info,rhi_osmosis_core=info",
            Verbosity::Verbose => "osmosis=debug,rhi_osmosis_core=debug",
        }
    }
}

/// Logs go to stderr: a worker's stdout is its result channel.
fn init_tracing(default: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[derive(Parser)]
#[command(name = "osmosis")]
#[command(about = "Batch migration execution engine", long_about = None)]
struct Cli {
    /// Verbose output (show debug info)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to the converter definition (default: ./osmosis.toml, then ~/.config/osmosis/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the converter's steps against the main store
    Run {
        /// Main store database file (overrides [store] path)
        #[arg(long)]
        store: Option<PathBuf>,
        /// Number of workers for parallel steps (default: available cores)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Work queue capacity (default: twice the worker count)
        #[arg(long)]
        queue_capacity: Option<usize>,
        /// Worker channel framing (msgpack, jsonl)
        #[arg(long)]
        codec: Option<Codec>,
        /// Directory for per-run shard directories (default: system temp dir)
        #[arg(long)]
        scratch_dir: Option<PathBuf>,
        /// Run only these steps
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
        /// Skip these steps
        #[arg(long, value_delimiter = ',')]
        skip: Vec<String>,
    },

    /// List the converter's steps
    Steps,

    /// Serve one shard over stdin/stdout (spawned by `run`)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        step: String,
        #[arg(long)]
        shard: PathBuf,
        #[arg(long, default_value_t = Codec::MsgPack)]
        codec: Codec,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Generate man page
    Manpage,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    let verbosity = Verbosity::from_flags(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Run {
            store,
            workers,
            queue_capacity,
            codec,
            scratch_dir,
            only,
            skip,
        } => {
            init_tracing(verbosity.default_filter());
            let config = Config::load(cli.config.as_deref())?;
            let options = RunOptions {
                store,
                workers,
                queue_capacity,
                codec,
                scratch_dir,
                only,
                skip,
            };
            cmd_run(&config, options, verbosity)
        }
        Commands::Steps => {
            let config = Config::load(cli.config.as_deref())?;
            cmd_steps(&config, verbosity)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Worker { step, shard, codec } => {
            init_tracing("osmosis=warn,rhi_osmosis_core=warn");
            let config = Config::load(cli.config.as_deref())?;
            cmd_worker(&config, &step, &shard, codec)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "osmosis", &mut io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Manpage => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            man.render(&mut io::stdout())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `run` flags that override the definition file.
struct RunOptions {
    store: Option<PathBuf>,
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    codec: Option<Codec>,
    scratch_dir: Option<PathBuf>,
    only: Vec<String>,
    skip: Vec<String>,
}

fn executor_config(config: &Config, options: &RunOptions, v: Verbosity) -> Result<ExecutorConfig> {
    let section = &config.executor;
    let mut exec = ExecutorConfig::new().with_display(match v {
        Verbosity::Quiet => DisplayMode::Hidden,
        _ => DisplayMode::Live,
    });

    if let Some(workers) = options.workers.or(section.workers) {
        exec = exec.with_workers(workers);
    }
    if let Some(capacity) = options.queue_capacity.or(section.queue_capacity) {
        exec = exec.with_queue_capacity(capacity);
    }
    let codec = match (options.codec, section.codec.as_deref()) {
        (Some(codec), _) => Some(codec),
        (None, Some(name)) => Some(
            name.parse::<Codec>()
                .map_err(anyhow::Error::msg)
                .context("Invalid [executor] codec")?,
        ),
        (None, None) => None,
    };
    if let Some(codec) = codec {
        exec = exec.with_codec(codec);
    }
    let scratch = options
        .scratch_dir
        .clone()
        .or_else(|| section.scratch_dir.as_deref().map(|p| config.resolve(p)));
    if let Some(dir) = scratch {
        exec = exec.with_scratch_dir(dir);
    }
    Ok(exec)
}

/// Launch workers as `osmosis worker` children of this same binary.
fn process_launcher(config: &Config) -> Result<ProcessLauncher> {
    let exe = std::env::current_exe().context("Failed to locate the osmosis binary")?;
    let config_path = config.source().map(Path::to_path_buf);

    Ok(ProcessLauncher::new(move |invocation| {
        let mut cmd = Command::new(&exe);
        if let Some(path) = &config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg("worker")
            .arg("--step")
            .arg(invocation.step)
            .arg("--shard")
            .arg(invocation.shard)
            .arg("--codec")
            .arg(invocation.codec.name());
        cmd
    }))
}

fn cmd_run(config: &Config, options: RunOptions, v: Verbosity) -> Result<ExitCode> {
    let store_path = options
        .store
        .clone()
        .or_else(|| config.store.path.as_deref().map(|p| config.resolve(p)))
        .context("No main store configured. Set [store] path or pass --store.")?;
    let steps = steps::build_steps(config)?;
    if steps.is_empty() {
        v.info("No steps defined; nothing to do.");
        return Ok(ExitCode::SUCCESS);
    }

    let exec = executor_config(config, &options, v)?;
    v.debug(&format!(
        "store: {}, workers: {}, queue: {}, codec: {}",
        store_path.display(),
        exec.workers(),
        exec.queue_capacity(),
        exec.codec()
    ));

    let interrupt = Interrupt::new();
    let handle = interrupt.clone();
    ctrlc::set_handler(move || handle.raise()).context("Failed to install Ctrl-C handler")?;

    let converter = Converter::new(&store_path, steps)
        .with_config(exec)
        .with_launcher(Arc::new(process_launcher(config)?))
        .with_interrupt(interrupt)
        .with_only(options.only)
        .with_skip(options.skip);

    match converter.run() {
        Ok(summary) => {
            for step in &summary.steps {
                v.result(&format!(
                    "{}: {} ({:.1?})",
                    step.title, step.status, step.duration
                ));
            }
            v.info(&format!(
                "Done in {:.1?}; output in {}",
                summary.duration,
                store_path.display()
            ));
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ RunError::Aborted) => Ok(ExitCode::from(e.exit_code() as u8)),
        Err(e) => Err(e).context("Migration failed"),
    }
}

fn cmd_steps(config: &Config, v: Verbosity) -> Result<()> {
    let steps = steps::build_steps(config)?;
    if steps.is_empty() {
        v.info("No steps defined.");
        return Ok(());
    }
    for (step, def) in steps.iter().zip(&config.steps) {
        let mode = if step.parallelizable() { "parallel" } else { "serial" };
        let kind = def.kind.as_deref().unwrap_or(&def.name);
        v.result(&format!("{:<20} {:<8} -> {:<16} {}", step.name(), mode, kind, step.title()));
    }
    Ok(())
}

fn cmd_worker(config: &Config, step_name: &str, shard: &Path, codec: Codec) -> Result<()> {
    // The parent decides when to stop; Ctrl-C reaches the whole process group.
    ctrlc::set_handler(|| {}).context("Failed to install Ctrl-C handler")?;

    let steps = steps::build_steps(config)?;
    let Some(step) = steps.into_iter().find(|s| s.name() == step_name) else {
        bail!("Unknown step '{step_name}'");
    };
    let store = Store::open(shard, Schema::core())
        .with_context(|| format!("Failed to open shard {}", shard.display()))?;

    let served = serve_worker(
        step.as_ref(),
        &store,
        codec,
        io::stdin().lock(),
        BufWriter::new(io::stdout().lock()),
    )
    .context("Worker channel failed")?;
    tracing::debug!(step = step_name, served, "worker finished");
    Ok(())
}
