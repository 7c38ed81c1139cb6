use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lspboot::{ConfigLoader, LanguageServer, StrategyRegistry, TracingSink};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Bootstrap a language server and query it from the command line
///
/// The server is downloaded and installed on first use, started for the
/// workspace, asked one question and shut down again.
#[derive(Parser, Debug)]
#[command(name = "lspboot")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workspace root directory
    ///
    /// If not specified, attempts to auto-detect from:
    /// 1. Current directory's git root
    /// 2. Current working directory
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Language server to use (defaults to the config file, then the file extension)
    #[arg(short = 'L', long)]
    language: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log every JSON-RPC message exchanged with the server
    #[arg(long)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install the language server without starting it
    Install,

    /// Start the server, print its capabilities and stop it
    Check,

    /// Go to the definition of the symbol at a position
    Definition(PositionArgs),

    /// Find references to the symbol at a position
    References {
        #[command(flatten)]
        position: PositionArgs,

        /// Leave the declaration itself out of the results
        #[arg(long)]
        exclude_declaration: bool,
    },

    /// Go to implementations of the symbol at a position
    Implementation(PositionArgs),

    /// Completion items at a position
    Completion(PositionArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct PositionArgs {
    /// Source file
    file: PathBuf,

    /// Zero-based line
    line: u32,

    /// Zero-based character offset
    character: u32,
}

impl Command {
    fn position(&self) -> Option<&PositionArgs> {
        match self {
            Command::Install | Command::Check => None,
            Command::Definition(position)
            | Command::Implementation(position)
            | Command::Completion(position) => Some(position),
            Command::References { position, .. } => Some(position),
        }
    }
}

fn setup_logging(log_level: &str, log_file: Option<PathBuf>) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if let Some(log_path) = log_file {
        let file = std::fs::File::create(log_path)?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    Ok(())
}

fn detect_workspace_root(provided: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = provided {
        return path
            .canonicalize()
            .with_context(|| format!("Workspace {} does not exist", path.display()));
    }

    // Try to find git root
    let current_dir = std::env::current_dir()?;
    let mut dir = current_dir.as_path();

    loop {
        if dir.join(".git").exists() {
            info!("Detected git root: {}", dir.display());
            return Ok(dir.to_path_buf());
        }

        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }

    // Fall back to current directory
    info!("Using current directory as workspace root");
    Ok(current_dir)
}

/// `--language`, then the configured default, then the file extension
fn select_language(
    args: &Args,
    config: &ConfigLoader,
    registry: &StrategyRegistry,
) -> Result<String> {
    if let Some(language) = &args.language {
        return Ok(language.clone());
    }
    if let Some(language) = &config.settings().default_language {
        return Ok(language.clone());
    }
    if let Some(position) = args.command.position() {
        if let Some(language) = registry.language_for_file(&position.file) {
            return Ok(language.to_string());
        }
    }

    anyhow::bail!(
        "Cannot tell which language server to use; pass --language (available: {})",
        registry.languages().join(", ")
    )
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

async fn run(server: Arc<LanguageServer>, command: Command) -> Result<Value> {
    let output = match command {
        Command::Install => {
            let launch = server.install().await?;
            info!("Launch command: {}", launch.display());
            serde_json::to_value(launch)?
        }
        Command::Check => {
            server
                .scoped(|server| async move {
                    Ok(json!({
                        "language": server.language(),
                        "root": server.root(),
                        "capabilities": server.capabilities().cloned().unwrap_or(Value::Null),
                    }))
                })
                .await?
        }
        Command::Definition(position) => {
            let file = absolute(&position.file)?;
            server
                .scoped(|server| async move {
                    let result = server
                        .request_definition(&file, position.line, position.character)
                        .await?;
                    Ok(serde_json::to_value(result)?)
                })
                .await?
        }
        Command::References {
            position,
            exclude_declaration,
        } => {
            let file = absolute(&position.file)?;
            server
                .scoped(|server| async move {
                    let result = server
                        .request_references(
                            &file,
                            position.line,
                            position.character,
                            !exclude_declaration,
                        )
                        .await?;
                    Ok(serde_json::to_value(result)?)
                })
                .await?
        }
        Command::Implementation(position) => {
            let file = absolute(&position.file)?;
            server
                .scoped(|server| async move {
                    let result = server
                        .request_implementation(&file, position.line, position.character)
                        .await?;
                    Ok(serde_json::to_value(result)?)
                })
                .await?
        }
        Command::Completion(position) => {
            let file = absolute(&position.file)?;
            server
                .scoped(|server| async move {
                    let result = server
                        .request_completion(&file, position.line, position.character)
                        .await?;
                    Ok(serde_json::to_value(result)?)
                })
                .await?
        }
    };

    Ok(output)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.log_file.clone())?;

    info!("Starting lspboot v{}", env!("CARGO_PKG_VERSION"));

    // Detect workspace root
    let workspace_root = detect_workspace_root(args.workspace.clone())?;
    info!("Workspace root: {}", workspace_root.display());

    let logger = TracingSink::shared();
    let mut config = ConfigLoader::new(Arc::clone(&logger))?;
    if args.trace {
        config.settings_mut().trace_lsp_communication = true;
    }
    let registry = StrategyRegistry::from_config(&config);

    let language = select_language(&args, &config, &registry)?;
    let server = Arc::new(LanguageServer::create(
        &language,
        &workspace_root,
        &config,
        &registry,
        logger,
    )?);

    let output = run(server, args.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
