use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use classbox::api;
use classbox::auth::{AuthConfig, AuthState};
use classbox::container::{DockerRuntime, RuntimeClient, RuntimeConfig};
use classbox::db::Database;
use classbox::lifecycle::{LifecycleConfig, LifecycleOrchestrator};
use classbox::projects::{NewProject, ProjectDirectory, ProjectRepository};
use classbox::store::{SharedStore, SqliteStateBackend, WorkerRegistry};
use classbox::terminal::{TerminalBridge, TerminalConfig};

const APP_NAME: &str = "classbox";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_projects(ctx: RuntimeContext, cmd: ProjectsCommand) -> Result<()> {
    handle_projects(&ctx, cmd).await
}

#[tokio::main]
async fn async_sweep(ctx: RuntimeContext) -> Result<()> {
    handle_sweep(&ctx).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Projects { command } => async_projects(ctx, command),
        Command::Sweep => async_sweep(ctx),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Classbox - project containers and browser terminals for student workspaces.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Manage project records of a standalone deployment
    Projects {
        #[command(subcommand)]
        command: ProjectsCommand,
    },
    /// Reclaim terminal sessions left behind by dead workers, then exit
    Sweep,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Subcommand)]
enum ProjectsCommand {
    /// Create or update a project
    Add(ProjectsAddCommand),
    /// List projects
    List,
    /// Allow a user to operate a project
    Grant(ProjectsGrantCommand),
}

#[derive(Debug, Clone, Args)]
struct ProjectsAddCommand {
    /// Project identifier
    id: String,
    /// Display name (defaults to the id)
    #[arg(long)]
    name: Option<String>,
    /// Host port published for the project's service
    #[arg(long)]
    host_port: Option<u16>,
    /// Port the service listens on inside the container
    #[arg(long)]
    container_port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct ProjectsGrantCommand {
    /// Project identifier
    project_id: String,
    /// User identifier (the token subject)
    user_id: String,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&mut paths, &common)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("classbox={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // The services log through `log`.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {} and state dir {}",
                self.paths.data_dir.display(),
                self.paths.state_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        Ok(())
    }

    /// Project records live in the data directory.
    fn database_path(&self) -> PathBuf {
        self.paths.data_dir.join("classbox.db")
    }

    async fn open_database(&self) -> Result<Database> {
        let path = self.database_path();
        info!("Database path: {}", path.display());
        Database::new(&path).await
    }

    /// Shared store on the project database, or on `store.database` when
    /// configured. Falls back to process-local state if that cannot be opened.
    async fn open_store(&self, database: &Database) -> Result<SharedStore> {
        let Some(ref path) = self.config.store.database else {
            return Ok(SharedStore::new(Arc::new(SqliteStateBackend::new(
                database.pool().clone(),
            ))));
        };

        let path = expand_str_path(path)?;
        match Database::new(&path).await {
            Ok(db) => {
                info!("Shared state database: {}", path.display());
                Ok(SharedStore::new(Arc::new(SqliteStateBackend::new(
                    db.pool().clone(),
                ))))
            }
            Err(e) => {
                error!(
                    "Shared state database {} unavailable, coordination is limited to this process: {:#}",
                    path.display(),
                    e
                );
                Ok(SharedStore::local_only())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
    state_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
            state_dir: default_state_dir()?,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    paths: PathsConfig,
    server: ServerConfig,
    container: RuntimeConfig,
    lifecycle: LifecycleConfig,
    terminal: TerminalConfig,
    store: StoreConfig,
    auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: Option<String>,
    state_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct StoreConfig {
    /// Separate shared state database. Uses the project database when unset.
    database: Option<String>,
    heartbeat_interval_secs: u64,
    /// Workers whose heartbeat is older than this are considered dead.
    heartbeat_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: None,
            heartbeat_interval_secs: 10,
            heartbeat_ttl_secs: 30,
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_projects(ctx: &RuntimeContext, cmd: ProjectsCommand) -> Result<()> {
    let database = ctx.open_database().await?;
    let repo = ProjectRepository::new(database.pool().clone());

    match cmd {
        ProjectsCommand::Add(add) => {
            if add.id.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(anyhow!("project id {:?} must be lowercase", add.id));
            }
            let project = NewProject {
                name: add.name.unwrap_or_else(|| add.id.clone()),
                id: add.id,
                host_port: add.host_port,
                container_port: add.container_port,
            };
            if ctx.common.dry_run {
                info!("dry-run: would save project {}", project.id);
                return Ok(());
            }
            let saved = repo.upsert(&project).await?;
            if ctx.common.json {
                println!("{}", serde_json::to_string_pretty(&saved)?);
            } else {
                println!("Saved project {} ({})", saved.id, saved.name);
            }
        }
        ProjectsCommand::List => {
            let projects = repo.list().await?;
            if ctx.common.json {
                println!("{}", serde_json::to_string_pretty(&projects)?);
            } else if ctx.common.yaml {
                println!("{}", serde_yaml::to_string(&projects)?);
            } else if projects.is_empty() {
                println!("No projects.");
            } else {
                for project in projects {
                    let ports = match project.ports() {
                        Some((host, container)) => format!("{} -> {}", host, container),
                        None => "no ports".to_string(),
                    };
                    let members = repo.members(&project.id).await?;
                    println!(
                        "{}\t{}\t{}\tmembers: {}",
                        project.id,
                        project.name,
                        ports,
                        members.join(", ")
                    );
                }
            }
        }
        ProjectsCommand::Grant(grant) => {
            if repo.get(&grant.project_id).await?.is_none() {
                return Err(anyhow!("project not found: {}", grant.project_id));
            }
            if ctx.common.dry_run {
                info!(
                    "dry-run: would grant {} access to {}",
                    grant.user_id, grant.project_id
                );
                return Ok(());
            }
            repo.add_member(&grant.project_id, &grant.user_id).await?;
            println!("Granted {} access to {}", grant.user_id, grant.project_id);
        }
    }

    Ok(())
}

/// Pieces shared by `serve` and `sweep`.
struct Services {
    store: SharedStore,
    workers: Arc<WorkerRegistry>,
    projects: Arc<dyn ProjectDirectory>,
    lifecycle: LifecycleOrchestrator,
    terminals: TerminalBridge,
}

async fn build_services(ctx: &RuntimeContext) -> Result<Services> {
    ctx.config
        .terminal
        .validate()
        .context("Invalid terminal configuration")?;
    ctx.config
        .container
        .validate()
        .context("Invalid container configuration")?;
    ctx.config
        .lifecycle
        .validate()
        .context("Invalid lifecycle configuration")?;
    if ctx.config.store.heartbeat_interval_secs == 0
        || ctx.config.store.heartbeat_ttl_secs <= ctx.config.store.heartbeat_interval_secs
    {
        return Err(anyhow!(
            "store.heartbeat_ttl_secs must exceed a positive store.heartbeat_interval_secs"
        ));
    }

    let database = ctx.open_database().await?;
    let store = ctx.open_store(&database).await?;
    let workers = Arc::new(WorkerRegistry::new(
        &store,
        Duration::from_secs(ctx.config.store.heartbeat_ttl_secs),
    ));
    info!("Worker id: {}", workers.worker_id());

    let docker = DockerRuntime::new(ctx.config.container.clone());
    let runtime = RuntimeClient::new(Arc::new(docker), &ctx.config.container);
    if runtime.is_available().await {
        info!(
            "Container runtime ({}) is available",
            ctx.config.container.runtime
        );
    } else {
        warn!("Container runtime is not reachable. Container operations will fail until it is.");
    }

    let projects: Arc<dyn ProjectDirectory> =
        Arc::new(ProjectRepository::new(database.pool().clone()));
    let lifecycle = LifecycleOrchestrator::new(
        runtime.clone(),
        projects.clone(),
        &store,
        workers.clone(),
        ctx.config.lifecycle.clone(),
    );
    let terminals = TerminalBridge::new(
        runtime,
        projects.clone(),
        &store,
        workers.clone(),
        ctx.config.lifecycle.clone(),
        ctx.config.terminal.clone(),
    );

    Ok(Services {
        store,
        workers,
        projects,
        lifecycle,
        terminals,
    })
}

async fn handle_sweep(ctx: &RuntimeContext) -> Result<()> {
    let services = build_services(ctx).await?;
    let reclaimed = services.terminals.sweep_orphans().await;
    println!("Reclaimed {} orphaned terminal session(s)", reclaimed);
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting classbox server...");

    let auth_config = ctx.config.auth.clone();
    auth_config
        .validate()
        .context("Invalid auth configuration")?;
    info!(
        "Auth mode: {}",
        if auth_config.dev_mode {
            "development"
        } else {
            "production"
        }
    );
    let auth_state = AuthState::new(auth_config);

    let services = build_services(ctx).await?;
    if !services.store.is_shared() {
        warn!("Running without a shared store; other workers will not see this one");
    }

    let background = CancellationToken::new();
    services.workers.heartbeat().await;
    let heartbeat = services.workers.spawn_heartbeat(
        Duration::from_secs(ctx.config.store.heartbeat_interval_secs),
        background.clone(),
    );

    let reclaimed = services.terminals.sweep_orphans().await;
    if reclaimed > 0 {
        info!("Reclaimed {} orphaned terminal sessions at startup", reclaimed);
    }
    let janitor = services.terminals.spawn_janitor(
        Duration::from_secs(ctx.config.terminal.sweep_interval_secs),
        background.clone(),
    );

    let state = api::AppState::new(
        services.projects.clone(),
        services.lifecycle.clone(),
        services.terminals.clone(),
        auth_state,
        services.store.is_shared(),
    );
    let app = api::create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("invalid address")?;

    info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let shutdown_signal = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    info!("Closing terminal sessions and waiting for start sequences...");
    services.terminals.shutdown().await;
    services.lifecycle.shutdown().await;

    background.cancel();
    let _ = tokio::join!(heartbeat, janitor);
    services.workers.retire().await;

    info!("Shutdown complete");
    Ok(())
}

fn load_or_init_config(paths: &mut AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let config: AppConfig = built.try_deserialize()?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {}\n# File: {}\n\n",
        APP_NAME,
        path.display()
    )
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display()
        )
    }
}
