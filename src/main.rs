//! Halldyll Infra CLI entrypoint.
//!
//! This is the main entrypoint for the halldyll-infra command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use halldyll_infra::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use halldyll_infra::config::{
    ConfigParser, ConfigValidator, InfraConfig, StateBackend, ValidationError, find_config_file,
};
use halldyll_infra::error::{ConfigError, InfraError, Result};
use halldyll_infra::graph::GraphBuilder;
use halldyll_infra::planner::CancelSignal;
use halldyll_infra::provider::ProviderRegistry;
use halldyll_infra::reconciler::Reconciler;
use halldyll_infra::state::{LocalStateStore, S3StateStore, STATE_DIR, StateStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Default declaration file written by `init`.
const CONFIG_TEMPLATE: &str = include_str!("../templates/halldyll.infra.yaml");

/// Example environment file written by `init`.
const ENV_TEMPLATE: &str = include_str!("../templates/.env.example");

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            if e.is_pre_execution() {
                eprintln!("No changes were made.");
            }
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Graph => cmd_graph(config_path, &formatter),
        Commands::Plan { detailed } => cmd_plan(config_path, detailed, &formatter).await,
        Commands::Apply { yes, concurrency } => cmd_apply(config_path, yes, concurrency, &formatter).await,
        Commands::Destroy { yes, concurrency } => cmd_destroy(config_path, yes, concurrency, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    if !output.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<ExitCode> {
    info!("Initializing new Halldyll Infra project in: {}", path.display());

    let config_path = path.join("halldyll.infra.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(ExitCode::FAILURE);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, CONFIG_TEMPLATE)?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, ENV_TEMPLATE)?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();

        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# Halldyll Infra")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit halldyll.infra.yaml to declare your resources");
    eprintln!("  2. Run 'halldyll-infra validate' to check the declarations");
    eprintln!("  3. Run 'halldyll-infra plan' to see what will change");
    eprintln!("  4. Run 'halldyll-infra apply' to reconcile");

    Ok(ExitCode::SUCCESS)
}

/// Validate configuration and graph.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (config, config_file) = load_config(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let mut result = ConfigValidator::new().check(&config);
    if let Err(e) = GraphBuilder::new().build(&config.resources) {
        result.errors.push(ValidationError {
            field: String::from("resources"),
            message: e.to_string(),
        });
    }

    emit(&formatter.format_validation(&config, &result, show_warnings))?;

    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Show the resource graph.
fn cmd_graph(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (config, _) = load_config(config_path)?;
    ConfigValidator::new().validate(&config)?;

    let graph = GraphBuilder::new().build(&config.resources)?;
    let order = graph.topological_order()?;

    emit(&formatter.format_graph(&graph, &order))?;
    Ok(ExitCode::SUCCESS)
}

/// Show the execution plan.
async fn cmd_plan(config_path: Option<&Path>, detailed: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let providers = ProviderRegistry::from_config(&config.providers)?;

    let result = Reconciler::new(&config, &state_store, providers).plan().await?;

    emit(&formatter.format_plan(&result.diff, &result.plan, detailed))?;
    Ok(ExitCode::SUCCESS)
}

/// Apply the execution plan.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (mut config, state_store) = load_config_and_state(config_path).await?;
    if let Some(concurrency) = concurrency {
        config.execution.concurrency = concurrency;
        ConfigValidator::new().validate(&config)?;
    }
    let providers = ProviderRegistry::from_config(&config.providers)?;
    let cancel = cancel_on_ctrl_c();
    let reconciler = Reconciler::new(&config, &state_store, providers).with_cancel(cancel);

    let preview = reconciler.plan().await?;
    if preview.plan.is_empty() {
        // Still runs: records a new declaration hash or changed outputs.
        let settled = reconciler.apply().await?;
        emit(&formatter.format_reconciliation(&settled))?;
        return Ok(ExitCode::SUCCESS);
    }

    let reconciler = if auto_approve {
        reconciler
    } else {
        eprintln!("{}", formatter.format_plan(&preview.diff, &preview.plan, true));
        if !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
        reconciler.with_expected_plan(preview.plan.fingerprint.clone())
    };

    let result = reconciler.apply().await?;
    emit(&formatter.format_reconciliation(&result))?;
    Ok(if result.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (mut config, state_store) = load_config_and_state(config_path).await?;
    if let Some(concurrency) = concurrency {
        config.execution.concurrency = concurrency;
        ConfigValidator::new().validate(&config)?;
    }

    let providers = ProviderRegistry::from_config(&config.providers)?;
    let reconciler = Reconciler::new(&config, &state_store, providers).with_cancel(cancel_on_ctrl_c());

    let preview = reconciler.plan_destroy().await?;
    if preview.plan.is_empty() {
        eprintln!("No resources to destroy.");
        return Ok(ExitCode::SUCCESS);
    }

    let reconciler = if auto_approve {
        reconciler
    } else {
        eprintln!("The following resources will be destroyed:");
        for step in &preview.plan.steps {
            eprintln!(
                "  - {}.{} ({})",
                step.resource_type,
                step.name,
                step.external_id.as_deref().unwrap_or("-")
            );
        }
        if !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
            eprintln!("Destruction cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
        reconciler.with_expected_plan(preview.plan.fingerprint.clone())
    };

    let result = reconciler.destroy().await?;
    emit(&formatter.format_reconciliation(&result))?;
    Ok(if result.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// State management commands.
async fn cmd_state(config_path: Option<&Path>, command: StateCommands, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (_config, state_store) = load_config_and_state(config_path).await?;

    match command {
        StateCommands::Show => match state_store.load().await? {
            Some(state) => emit(&formatter.format_state(&state))?,
            None => eprintln!("No state found."),
        },
        StateCommands::Lock => {
            let lock = state_store.get_lock_info().await?;
            emit(&formatter.format_lock(lock.as_ref()))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock) = state_store.get_lock_info().await? {
                    warn!("Force-unlocking state held by {}", lock.holder);
                    state_store.release_lock(&lock.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                state_store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Cancels in-flight work on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancelSignal {
    let cancel = CancelSignal::new();
    let handle = cancel.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping dispatch and aborting in-flight calls");
            handle.cancel();
        }
    });

    cancel
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads the declaration file with `.env` and environment overrides.
fn load_config(config_path: Option<&Path>) -> Result<(InfraConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config, config_file))
}

/// Loads and validates configuration and creates the configured state store.
async fn load_config_and_state(config_path: Option<&Path>) -> Result<(InfraConfig, Box<dyn StateStore>)> {
    let (config, config_file) = load_config(config_path)?;
    ConfigValidator::new().validate(&config)?;

    let state_store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => Box::new(LocalStateStore::beside(
            &config_file,
            config.state.path.as_deref().map(Path::new),
        )),
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                InfraError::Config(ConfigError::validation("S3 bucket not configured", "state.bucket"))
            })?;
            Box::new(S3StateStore::new(bucket, config.state.prefix.as_deref(), config.state.region.as_deref()).await)
        }
    };

    debug!("Using {} state backend", state_store.backend_type());
    Ok((config, state_store))
}

/// Directory holding the declaration file.
fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}
