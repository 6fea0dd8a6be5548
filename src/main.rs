mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use flowrun_config::Flow;
use flowrun_dedup::{Deduplicator, MemoryDeduplicator, SqliteDeduplicator};
use flowrun_executor::{ChannelNotifier, ExecutionEvent, ExecutionService, Executor, FlowCache};
use flowrun_queue::{MemoryQueue, QueueBackend, Queues, SqliteQueue};
use flowrun_registry::{
  InstanceRepository, MemoryInstanceRepository, Registry, SqliteInstanceRepository,
};
use flowrun_store::{ExecutionStore, MemoryExecutionStore, SqliteExecutionStore};
use flowrun_worker::Worker;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::settings::Settings;

/// Flowrun - a distributed workflow executor
#[derive(Parser)]
#[command(name = "flowrun")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.flowrun)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// JSON settings file
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// SQLite database shared by the processes (default: <data-dir>/flowrun.db)
  #[arg(long, global = true)]
  database: Option<PathBuf>,

  /// Debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a flow to completion in this process, with in-memory queues
  Run {
    /// Path to the flow file (JSON)
    flow_file: PathBuf,

    /// Inputs of the execution, as a JSON object
    #[arg(long)]
    inputs: Option<String>,

    /// Number of workers to start
    #[arg(long, default_value_t = 1)]
    workers: usize,
  },

  /// Run an executor against the database
  Executor,

  /// Run a worker against the database
  Worker {
    /// Only run the tasks of this worker group
    #[arg(long)]
    group: Option<String>,

    /// Maximum number of tasks running at once
    #[arg(long)]
    concurrency: Option<usize>,
  },

  /// Publish a flow and start an execution of it
  Submit {
    /// Path to the flow file (JSON)
    flow_file: PathBuf,

    /// Inputs of the execution, as a JSON object
    #[arg(long)]
    inputs: Option<String>,
  },

  /// Kill a running execution
  Kill { execution_id: String },

  /// Run the failed parts of a terminated execution again
  Restart { execution_id: String },

  /// Create or upgrade the database schema
  Migrate,
}

/// The shared pieces every process is built from.
struct Components {
  queues: Queues,
  store: Arc<dyn ExecutionStore>,
  dedup: Arc<dyn Deduplicator>,
  registry: Arc<Registry>,
  flows: Arc<FlowCache>,
}

impl Components {
  fn new(
    backend: Arc<dyn QueueBackend>,
    store: Arc<dyn ExecutionStore>,
    dedup: Arc<dyn Deduplicator>,
    repository: Arc<dyn InstanceRepository>,
    settings: &Settings,
  ) -> Self {
    let queues = Queues::new(backend, settings.queue.clone());
    let registry = Arc::new(Registry::new(
      repository,
      queues.worker_task.clone(),
      settings.registry.clone(),
    ));
    let flows = Arc::new(FlowCache::from_queue(queues.flow.clone()));

    Self {
      queues,
      store,
      dedup,
      registry,
      flows,
    }
  }

  fn memory(settings: &Settings) -> Self {
    Self::new(
      Arc::new(MemoryQueue::new()),
      Arc::new(MemoryExecutionStore::new()),
      Arc::new(MemoryDeduplicator::new()),
      Arc::new(MemoryInstanceRepository::new()),
      settings,
    )
  }

  async fn sqlite(path: &Path, settings: &Settings) -> Result<Self> {
    let pool = flowrun_store::connect(path)
      .await
      .with_context(|| format!("failed to open database: {}", path.display()))?;
    flowrun_store::migrate(&pool)
      .await
      .context("failed to migrate database")?;

    Ok(Self::new(
      Arc::new(SqliteQueue::new(pool.clone())),
      Arc::new(SqliteExecutionStore::new(pool.clone())),
      Arc::new(SqliteDeduplicator::new(pool.clone())),
      Arc::new(SqliteInstanceRepository::new(pool)),
      settings,
    ))
  }

  fn executor(&self, settings: &Settings) -> Executor {
    Executor::new(
      self.flows.clone(),
      self.store.clone(),
      self.dedup.clone(),
      self.registry.clone(),
      self.queues.clone(),
    )
    .with_config(settings.executor.clone())
  }

  fn worker(&self, settings: &Settings) -> Worker {
    Worker::new(
      self.registry.clone(),
      self.queues.clone(),
      settings.worker.clone(),
    )
  }

  fn service(&self) -> ExecutionService {
    ExecutionService::new(self.store.clone(), self.flows.clone(), self.queues.clone())
  }
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let settings = Settings::load(cli.config.as_deref())?;
  settings.init_logging(cli.verbose)?;

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".flowrun"),
  };
  let database = cli
    .database
    .unwrap_or_else(|| data_dir.join("flowrun.db"));

  let Some(command) = cli.command else {
    println!("flowrun - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    match command {
      Commands::Run {
        flow_file,
        inputs,
        workers,
      } => run_flow(&settings, &flow_file, inputs.as_deref(), workers).await,
      Commands::Executor => run_executor(&settings, &data_dir, &database).await,
      Commands::Worker { group, concurrency } => {
        let mut settings = settings.clone();
        if group.is_some() {
          settings.worker.worker_group = group;
        }
        if let Some(concurrency) = concurrency {
          settings.worker.concurrency = concurrency;
        }
        run_worker(&settings, &data_dir, &database).await
      }
      Commands::Submit { flow_file, inputs } => {
        let components = open(&settings, &data_dir, &database).await?;
        let flow = read_flow(&flow_file).await?;
        let service = components.service();
        service
          .publish_flow(&flow)
          .await
          .context("failed to publish flow")?;
        let execution = service
          .submit(&flow, parse_inputs(inputs.as_deref())?)
          .await
          .context("failed to submit execution")?;
        println!("{}", execution.id);
        Ok(())
      }
      Commands::Kill { execution_id } => {
        let components = open(&settings, &data_dir, &database).await?;
        components
          .service()
          .kill(&execution_id)
          .await
          .context("failed to request kill")?;
        Ok(())
      }
      Commands::Restart { execution_id } => {
        let components = open(&settings, &data_dir, &database).await?;
        components
          .service()
          .restart(&execution_id)
          .await
          .context("failed to restart execution")?;
        Ok(())
      }
      Commands::Migrate => {
        tokio::fs::create_dir_all(&data_dir).await?;
        let pool = flowrun_store::connect(&database).await?;
        flowrun_store::migrate(&pool)
          .await
          .context("failed to migrate database")?;
        info!(database = %database.display(), "database_migrated");
        Ok(())
      }
    }
  })
}

async fn open(settings: &Settings, data_dir: &Path, database: &Path) -> Result<Components> {
  tokio::fs::create_dir_all(data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
  Components::sqlite(database, settings).await
}

async fn run_executor(settings: &Settings, data_dir: &Path, database: &Path) -> Result<()> {
  let components = open(settings, data_dir, database).await?;
  let executor = Arc::new(components.executor(settings));

  let cancel = CancellationToken::new();
  let handle = tokio::spawn(executor.run(cancel.clone()));

  tokio::signal::ctrl_c().await?;
  cancel.cancel();
  handle.await?;
  Ok(())
}

async fn run_worker(settings: &Settings, data_dir: &Path, database: &Path) -> Result<()> {
  let components = open(settings, data_dir, database).await?;
  let worker = Arc::new(components.worker(settings));

  let cancel = CancellationToken::new();
  let handle = tokio::spawn(worker.run(cancel.clone()));

  tokio::signal::ctrl_c().await?;
  cancel.cancel();
  handle.await??;
  Ok(())
}

/// Run one execution with an executor and `workers` workers in this process,
/// then print the terminated execution.
async fn run_flow(
  settings: &Settings,
  flow_file: &Path,
  inputs: Option<&str>,
  workers: usize,
) -> Result<()> {
  let flow = read_flow(flow_file).await?;
  let inputs = parse_inputs(inputs)?;
  let components = Components::memory(settings);

  let (tx, mut events) = mpsc::unbounded_channel();
  let executor = Arc::new(
    components
      .executor(settings)
      .with_notifier(Arc::new(ChannelNotifier::new(tx))),
  );

  let cancel = CancellationToken::new();
  let executor_handle = tokio::spawn(executor.run(cancel.child_token()));
  let mut worker_handles = Vec::with_capacity(workers);
  for _ in 0..workers.max(1) {
    let worker = Arc::new(components.worker(settings));
    worker_handles.push(tokio::spawn(worker.run(cancel.child_token())));
  }

  let service = components.service();
  service.publish_flow(&flow).await?;
  let execution = service.submit(&flow, inputs).await?;

  let terminated = loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        service.kill(&execution.id).await?;
      }
      event = events.recv() => match event {
        Some(ExecutionEvent::ExecutionTerminated { execution: done }) if done.id == execution.id => {
          break *done;
        }
        Some(_) => {}
        None => bail!("executor stopped before the execution ended"),
      },
    }
  };

  cancel.cancel();
  executor_handle.await?;
  for handle in worker_handles {
    handle.await??;
  }

  println!("{}", serde_json::to_string_pretty(&terminated)?);
  Ok(())
}

async fn read_flow(path: &Path) -> Result<Flow> {
  let content = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read flow file: {}", path.display()))?;

  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse flow file: {}", path.display()))
}

fn parse_inputs(inputs: Option<&str>) -> Result<Map<String, Value>> {
  let Some(inputs) = inputs else {
    return Ok(Map::new());
  };

  match serde_json::from_str(inputs).context("failed to parse inputs JSON")? {
    Value::Object(map) => Ok(map),
    other => bail!("inputs must be a JSON object, got {}", other),
  }
}
