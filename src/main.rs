//! Keystone CLI entrypoint.
//!
//! This is the main entrypoint for the keystone command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use keystone::cli::{Cli, Commands, OutputFormatter, StateCommands};
use keystone::config::{
    ConfigParser, ConfigValidator, DeployConfig, build_registry, executor_options,
    find_config_file, open_state_store,
};
use keystone::error::Result;
use keystone::executor::ExecutorOptions;
use keystone::planner::Plan;
use keystone::reconciler::Reconciler;
use keystone::state::{StateStore, generate_holder_id};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code of `plan` when the plan has changes.
const EXIT_PLAN_HAS_CHANGES: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system. `RUST_LOG` takes precedence over the
/// verbosity flag.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Cancellation token tripped by Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trip = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight actions");
            trip.cancel();
        }
    });
    token
}

/// Main async entry point. Returns the process exit code.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Graph => cmd_graph(config, &formatter),
        Commands::Plan { detailed, out, destroy } => {
            cmd_plan(config, detailed, out.as_deref(), destroy, &formatter).await
        }
        Commands::Apply { plan, yes, parallelism } => {
            cmd_apply(config, plan.as_deref(), yes, parallelism, &formatter).await
        }
        Commands::Reconcile { yes, max_attempts } => {
            cmd_reconcile(config, yes, max_attempts, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<u8> {
    info!("Initializing new Keystone project in: {}", path.display());

    let config_path = path.join("keystone.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(1);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/keystone.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(".keystone") {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# Keystone")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(".keystone") {
                writeln!(file, ".keystone/")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.keystone/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit keystone.yaml to declare your resources");
    eprintln!("  2. Run 'keystone validate' to check your configuration");
    eprintln!("  3. Run 'keystone plan' to see what will change");
    eprintln!("  4. Run 'keystone apply' to converge");

    Ok(0)
}

/// Validate configuration.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<u8> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    println!("{}", formatter.format_validation(&config, &result, show_warnings));

    Ok(u8::from(!result.is_valid()))
}

/// Print the dependency graph.
fn cmd_graph(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<u8> {
    let config_file = resolve_config_path(config_path)?;
    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;
    ConfigValidator::new().validate(&config)?;

    let graph = config.graph()?;
    let levels = graph.levels()?;
    println!("{}", formatter.format_graph(&graph, &levels));
    Ok(0)
}

/// Show the change plan. Exits 2 when the plan has changes.
async fn cmd_plan(
    config_path: Option<&Path>,
    detailed: bool,
    out: Option<&Path>,
    destroy: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let reconciler = load_reconciler(config_path).await?;

    let plan = if destroy {
        reconciler.plan_destroy().await?
    } else {
        reconciler.plan().await?
    };

    println!("{}", formatter.format_plan(&plan, detailed));

    if let Some(path) = out {
        plan.save(path)?;
        eprintln!("Plan saved to {}", path.display());
    }

    Ok(if plan.has_changes() { EXIT_PLAN_HAS_CHANGES } else { 0 })
}

/// Apply a saved or freshly computed plan.
async fn cmd_apply(
    config_path: Option<&Path>,
    plan_path: Option<&Path>,
    auto_approve: bool,
    parallelism: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let (config, reconciler) = load_config_and_reconciler(config_path).await?;
    let reconciler = match parallelism {
        Some(parallelism) => reconciler.with_options(ExecutorOptions {
            parallelism: parallelism.max(1),
            ..executor_options(&config)
        }),
        None => reconciler,
    };

    let plan = match plan_path {
        Some(path) => {
            debug!("Loading plan from {}", path.display());
            Plan::load(path)?
        }
        None => reconciler.plan().await?,
    };

    if !plan.has_changes() {
        eprintln!("No changes to apply.");
        return Ok(0);
    }

    if !formatter.is_json() {
        println!("{}", formatter.format_plan(&plan, false));
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(1);
    }

    let cancel = shutdown_token();
    let result = reconciler.apply(&plan, &cancel).await?;
    println!("{}", formatter.format_apply(&result));

    Ok(result.exit_code())
}

/// Refresh, plan and apply until converged.
async fn cmd_reconcile(
    config_path: Option<&Path>,
    auto_approve: bool,
    max_attempts: Option<u32>,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let mut reconciler = load_reconciler(config_path).await?;
    if let Some(max_attempts) = max_attempts {
        reconciler = reconciler.with_max_attempts(max_attempts);
    }

    if !auto_approve
        && !confirm(
            "This will converge your infrastructure to match the configuration. Continue? [y/N]: ",
            "y",
        )?
    {
        eprintln!("Reconciliation cancelled.");
        return Ok(1);
    }

    let cancel = shutdown_token();
    let report = reconciler.reconcile(&cancel).await?;
    println!("{}", formatter.format_reconcile(&report));

    Ok(report.exit_code())
}

/// Destroy every recorded resource.
async fn cmd_destroy(config_path: Option<&Path>, auto_approve: bool, formatter: &OutputFormatter) -> Result<u8> {
    let reconciler = load_reconciler(config_path).await?;

    let plan = reconciler.plan_destroy().await?;
    if !plan.has_changes() {
        eprintln!("No resources to destroy.");
        return Ok(0);
    }

    eprintln!("The following resources will be destroyed:");
    for action in plan.changes() {
        eprintln!("  - {}", action.key());
    }

    if !auto_approve && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
        eprintln!("Destruction cancelled.");
        return Ok(1);
    }

    let cancel = shutdown_token();
    let report = reconciler.destroy(&cancel).await?;
    println!("{}", formatter.format_reconcile(&report));

    Ok(report.exit_code())
}

/// Check for drift. Exits 2 when anything drifted.
async fn cmd_drift(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<u8> {
    let reconciler = load_reconciler(config_path).await?;
    let report = reconciler.check_drift().await?;
    println!("{}", formatter.format_drift(&report));

    Ok(if report.has_drift() { EXIT_PLAN_HAS_CHANGES } else { 0 })
}

/// State management commands.
async fn cmd_state(config_path: Option<&Path>, command: StateCommands, formatter: &OutputFormatter) -> Result<u8> {
    let (_config, store) = load_config_and_state(config_path).await?;

    match command {
        StateCommands::Show => {
            let snapshot = store.read().await?;
            let lock = store.lock_info().await?;
            println!("{}", formatter.format_state(&snapshot, lock.as_ref(), &store.location()));
        }
        StateCommands::List => {
            let snapshot = store.read().await?;
            println!("{}", formatter.format_records(&snapshot));
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            println!("{}", formatter.format_lock(&lock));
            eprintln!("State locked: {}", lock.lock_id);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                match store.force_unlock().await? {
                    Some(lock) => eprintln!("State forcefully unlocked (was held by {}).", lock.holder),
                    None => eprintln!("State was not locked."),
                }
            } else if let Some(id) = lock_id {
                match store.lock_info().await? {
                    Some(lock) if lock.lock_id == id => {
                        store.release_lock(&lock).await?;
                        eprintln!("State unlocked.");
                    }
                    Some(lock) => {
                        eprintln!("Lock {id} is not the current lock ({} held by {}).", lock.lock_id, lock.holder);
                        return Ok(1);
                    }
                    None => eprintln!("State was not locked."),
                }
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(1);
            }
        }
    }

    Ok(0)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Parser rooted at the configuration file's directory.
fn parser_for(config_file: &Path) -> ConfigParser {
    ConfigParser::new().with_base_path(config_file.parent().unwrap_or_else(|| Path::new(".")))
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Loads and validates the configuration, then opens its state store.
async fn load_config_and_state(config_path: Option<&Path>) -> Result<(DeployConfig, Arc<dyn StateStore>)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    let store = open_state_store(&config.state, &parser.base_dir()).await?;
    Ok((config, store))
}

/// Loads the configuration and builds a reconciler for it.
async fn load_config_and_reconciler(config_path: Option<&Path>) -> Result<(DeployConfig, Reconciler)> {
    let config_file = resolve_config_path(config_path)?;
    let base_dir = parser_for(&config_file).base_dir();
    let (config, store) = load_config_and_state(Some(config_file.as_path())).await?;
    let registry = build_registry(&config, &base_dir);
    let reconciler = Reconciler::from_config(&config, store, registry)?;
    Ok((config, reconciler))
}

/// Builds a reconciler when the caller has no further use for the config.
async fn load_reconciler(config_path: Option<&Path>) -> Result<Reconciler> {
    let (_, reconciler) = load_config_and_reconciler(config_path).await?;
    Ok(reconciler)
}
