use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use trellis_action::{ActionDispatcher, LogEmailSender};
use trellis_config::{EngineSettings, ProcessDef, SchedulingMode};
use trellis_definition::ProcessDefinition;
use trellis_engine::{ProcessEngine, SaveOptions, SignalBus, Worker};
use trellis_store::{Entity, EntityRef, SqliteStore};

/// Trellis - a process orchestration engine
#[derive(Parser)]
#[command(name = "trellis")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.trellis)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Database URL (default: sqlite://<data_dir>/trellis.db)
  #[arg(long, global = true)]
  database_url: Option<String>,

  /// Engine settings file (default: <data_dir>/trellis.json when present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Create or upgrade the database schema
  Migrate,

  /// Manage process definitions
  Definition {
    #[command(subcommand)]
    command: DefinitionCommand,
  },

  /// Save business entities
  Entity {
    #[command(subcommand)]
    command: EntityCommand,
  },

  /// Start, remove and inspect processes
  Process {
    #[command(subcommand)]
    command: ProcessCommand,
  },

  /// Run the continuation worker
  Worker {
    /// Override the configured scheduling mode
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
  },
}

#[derive(Subcommand)]
enum DefinitionCommand {
  /// Validate a definition file and store it
  Register {
    /// Path to the definition file (JSON)
    definition_file: PathBuf,
  },

  /// List stored definitions
  List,
}

#[derive(Subcommand)]
enum EntityCommand {
  /// Save an entity read from a file, or from stdin when omitted
  Save {
    entity_file: Option<PathBuf>,

    /// The save originates from a workflow
    #[arg(long)]
    skip_workflow: bool,

    /// Do not reactivate waiting flow nodes
    #[arg(long)]
    silent: bool,
  },
}

#[derive(Subcommand)]
enum ProcessCommand {
  /// Start a process from a stored definition; variables are read from stdin
  Start {
    definition: String,

    #[arg(long, requires = "target_id")]
    target_type: Option<String>,

    #[arg(long, requires = "target_type")]
    target_id: Option<String>,
  },

  /// Remove a process and its sub-processes
  Remove { process_id: String },

  /// Print a process and its flow nodes as JSON
  Show { process_id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
  Sequential,
  Parallel,
}

impl From<Mode> for SchedulingMode {
  fn from(mode: Mode) -> Self {
    match mode {
      Mode::Sequential => SchedulingMode::Sequential,
      Mode::Parallel => SchedulingMode::Parallel,
    }
  }
}

/// Resolved global options.
struct Env {
  data_dir: PathBuf,
  database_url: String,
  settings: EngineSettings,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,trellis=debug")),
    )
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".trellis"),
  };
  let database_url = cli
    .database_url
    .unwrap_or_else(|| format!("sqlite://{}", data_dir.join("trellis.db").display()));
  let settings = load_settings(cli.config.as_deref(), &data_dir)?;
  let env = Env {
    data_dir,
    database_url,
    settings,
  };

  let Some(command) = cli.command else {
    println!("trellis - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    match command {
      Commands::Migrate => migrate(&env).await,
      Commands::Definition { command } => match command {
        DefinitionCommand::Register { definition_file } => register_definition(&env, &definition_file).await,
        DefinitionCommand::List => list_definitions(&env).await,
      },
      Commands::Entity {
        command:
          EntityCommand::Save {
            entity_file,
            skip_workflow,
            silent,
          },
      } => {
        let options = SaveOptions {
          skip_workflow,
          silent,
          ..Default::default()
        };
        save_entity(&env, entity_file.as_deref(), options).await
      }
      Commands::Process { command } => match command {
        ProcessCommand::Start {
          definition,
          target_type,
          target_id,
        } => {
          let target = target_type.zip(target_id).map(|(t, id)| EntityRef::new(t, id));
          start_process(&env, &definition, target).await
        }
        ProcessCommand::Remove { process_id } => remove_process(&env, &process_id).await,
        ProcessCommand::Show { process_id } => show_process(&env, &process_id).await,
      },
      Commands::Worker { mode, once } => run_worker(env, mode, once).await,
    }
  })
}

fn load_settings(config: Option<&Path>, data_dir: &Path) -> Result<EngineSettings> {
  let path = match config {
    Some(path) => path.to_path_buf(),
    None => {
      let default = data_dir.join("trellis.json");
      if !default.exists() {
        return Ok(EngineSettings::default());
      }
      default
    }
  };

  let content = std::fs::read_to_string(&path)
    .with_context(|| format!("failed to read settings file: {}", path.display()))?;
  EngineSettings::from_json(&content)
    .with_context(|| format!("failed to parse settings file: {}", path.display()))
}

async fn open_store(env: &Env) -> Result<Arc<SqliteStore>> {
  tokio::fs::create_dir_all(&env.data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", env.data_dir.display()))?;
  let store = SqliteStore::connect(&env.database_url)
    .await
    .with_context(|| format!("failed to open database: {}", env.database_url))?;
  Ok(Arc::new(store))
}

/// An engine over the database with every stored definition registered.
async fn open_engine(env: &Env) -> Result<Arc<ProcessEngine>> {
  let store = open_store(env).await?;
  store.migrate().await.context("failed to migrate database")?;

  let bus = SignalBus::new();
  bus.subscribe("process.ended", |signal| {
    tracing::info!(process_id = %signal.payload["processId"], "process_ended_signal");
  });

  let engine = ProcessEngine::builder(store.clone(), store)
    .settings(env.settings.clone())
    .actions(ActionDispatcher::standard(Arc::new(LogEmailSender)))
    .notifier(Arc::new(bus))
    .build()
    .context("failed to create process engine")?;

  for def in read_definitions(&definitions_dir(env)).await? {
    let name = def.name.clone();
    engine
      .register_definition(def)
      .with_context(|| format!("stored definition '{}' is invalid", name))?;
  }
  Ok(Arc::new(engine))
}

fn definitions_dir(env: &Env) -> PathBuf {
  env.data_dir.join("definitions")
}

async fn read_definitions(dir: &Path) -> Result<Vec<ProcessDef>> {
  if !dir.exists() {
    return Ok(Vec::new());
  }

  let mut entries = tokio::fs::read_dir(dir)
    .await
    .with_context(|| format!("failed to read definitions directory: {}", dir.display()))?;
  let mut defs = Vec::new();
  while let Some(entry) = entries.next_entry().await? {
    let path = entry.path();
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
      continue;
    }
    defs.push(read_definition(&path).await?);
  }
  defs.sort_by(|a, b| a.name.cmp(&b.name));
  Ok(defs)
}

async fn read_definition(path: &Path) -> Result<ProcessDef> {
  let content = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read definition file: {}", path.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse definition file: {}", path.display()))
}

async fn migrate(env: &Env) -> Result<()> {
  let store = open_store(env).await?;
  store.migrate().await.context("failed to migrate database")?;
  eprintln!("Database ready: {}", env.database_url);
  Ok(())
}

async fn register_definition(env: &Env, definition_file: &Path) -> Result<()> {
  let def = read_definition(definition_file).await?;
  let definition = ProcessDefinition::new(def)
    .with_context(|| format!("invalid definition: {}", definition_file.display()))?;

  let dir = definitions_dir(env);
  tokio::fs::create_dir_all(&dir)
    .await
    .with_context(|| format!("failed to create definitions directory: {}", dir.display()))?;

  let file_name: String = definition
    .name()
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
    .collect();
  let path = dir.join(format!("{}.json", file_name));
  tokio::fs::write(&path, serde_json::to_string_pretty(definition.def())?)
    .await
    .with_context(|| format!("failed to write definition: {}", path.display()))?;

  eprintln!(
    "Registered definition '{}' ({} elements)",
    definition.name(),
    definition.def().elements.len()
  );
  Ok(())
}

async fn list_definitions(env: &Env) -> Result<()> {
  for def in read_definitions(&definitions_dir(env)).await? {
    let trigger = match &def.trigger {
      Some(trigger) => format!("{:?}", trigger.on),
      None => "manual".to_string(),
    };
    println!(
      "{}\t{}\t{}",
      def.name,
      def.target_type.as_deref().unwrap_or("-"),
      trigger
    );
  }
  Ok(())
}

async fn save_entity(env: &Env, entity_file: Option<&Path>, options: SaveOptions) -> Result<()> {
  let content = match entity_file {
    Some(path) => tokio::fs::read_to_string(path)
      .await
      .with_context(|| format!("failed to read entity file: {}", path.display()))?,
    None => read_stdin()?,
  };
  let entity: Entity = serde_json::from_str(&content).context("failed to parse entity JSON")?;

  let engine = open_engine(env).await?;
  let is_new = engine
    .save_entity(&entity, options)
    .await
    .context("failed to save entity")?;

  eprintln!(
    "{} {}/{}",
    if is_new { "Created" } else { "Updated" },
    entity.entity_type,
    entity.id
  );
  Ok(())
}

async fn start_process(env: &Env, definition: &str, target: Option<EntityRef>) -> Result<()> {
  let variables = read_variables_from_stdin()?;
  let engine = open_engine(env).await?;

  let process = engine
    .start_process(definition, target, variables, SaveOptions::default())
    .await
    .with_context(|| format!("failed to start process '{}'", definition))?;

  eprintln!("Started process: {}", process.name);
  println!("{}", process.id);
  Ok(())
}

async fn remove_process(env: &Env, process_id: &str) -> Result<()> {
  let engine = open_engine(env).await?;
  if !engine
    .remove_process(process_id, SaveOptions::default())
    .await
    .with_context(|| format!("failed to remove process '{}'", process_id))?
  {
    bail!("process '{}' not found or already removed", process_id);
  }

  eprintln!("Removed process: {}", process_id);
  Ok(())
}

async fn show_process(env: &Env, process_id: &str) -> Result<()> {
  let engine = open_engine(env).await?;
  let (process, flow_nodes) = engine
    .process_snapshot(process_id)
    .await
    .with_context(|| format!("failed to load process '{}'", process_id))?;

  let output = serde_json::json!({
    "process": process,
    "flowNodes": flow_nodes,
  });
  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

async fn run_worker(mut env: Env, mode: Option<Mode>, once: bool) -> Result<()> {
  if let Some(mode) = mode {
    env.settings.scheduling_mode = mode.into();
  }
  let engine = open_engine(&env).await?;
  let worker = Worker::new(engine);

  if once {
    let report = worker.tick().await.context("worker tick failed")?;
    eprintln!(
      "Jobs completed: {}, failed: {}",
      report.completed, report.failed
    );
    return Ok(());
  }

  let cancel = CancellationToken::new();
  let on_signal = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      on_signal.cancel();
    }
  });

  worker.start(cancel).await.context("worker failed")?;
  Ok(())
}

fn read_stdin() -> Result<String> {
  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read from stdin")?;
  Ok(input)
}

fn read_variables_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    return Ok(serde_json::json!({}));
  }

  let input = read_stdin()?;
  if input.trim().is_empty() {
    Ok(serde_json::json!({}))
  } else {
    serde_json::from_str(&input).context("failed to parse variables JSON from stdin")
  }
}
