//! Gangway CLI entrypoint.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use gangway_deploy_ec2::aws::{ComputeProvider, Ec2Client, Ec2Provisioner};
use gangway_deploy_ec2::cli::{Cli, Commands, OutputFormatter, StateCommands};
use gangway_deploy_ec2::config::{
    find_config_file, ConfigParser, ConfigValidator, DeployConfig, StateBackend,
};
use gangway_deploy_ec2::error::{GangwayError, Result};
use gangway_deploy_ec2::handoff::{
    HandoffNotifier, LogNotifier, RegistryCredentials, SshRemoteExecutor,
};
use gangway_deploy_ec2::outputs::OutputPublisher;
use gangway_deploy_ec2::readiness::{HttpProbe, ReadinessGate};
use gangway_deploy_ec2::reconciler::Reconciler;
use gangway_deploy_ec2::state::{LocalStateStore, S3StateStore, StateStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings),
        Commands::Plan { detailed } => cmd_plan(cli.config.as_ref(), detailed, &formatter).await,
        Commands::Apply {
            yes,
            continue_on_error,
        } => cmd_apply(cli.config.as_ref(), yes, continue_on_error, &formatter).await,
        Commands::Output { name } => cmd_output(cli.config.as_ref(), name, &formatter).await,
        Commands::Status => cmd_status(cli.config.as_ref(), &formatter).await,
        Commands::Deploy { yes, identity } => {
            cmd_deploy(cli.config.as_ref(), yes, identity, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(cli.config.as_ref(), yes, &formatter).await,
        Commands::State { command } => cmd_state(cli.config.as_ref(), command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &PathBuf, force: bool) -> Result<()> {
    info!("Initializing new Gangway project in: {}", path.display());

    let config_path = path.join("gangway.deploy.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Declaration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    let config_template = include_str!("../templates/gangway.deploy.yaml");
    std::fs::write(&config_path, config_template)?;
    eprintln!("Created: {}", config_path.display());

    let env_template = include_str!("../templates/.env.example");
    std::fs::write(&env_path, env_template)?;
    eprintln!("Created: {}", env_path.display());

    let gitignore_content = ".env\n.gangway/\n";
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(".gangway") {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Gangway")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(".gangway") {
                writeln!(file, ".gangway/")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, gitignore_content)?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized.");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and fill in your credentials");
    eprintln!("  2. Edit gangway.deploy.yaml with your instance declaration");
    eprintln!("  3. Run 'gangway validate' to check the declaration");
    eprintln!("  4. Run 'gangway plan' to see what will change");
    eprintln!("  5. Run 'gangway deploy' to provision and hand off");

    Ok(())
}

/// Validate the declaration.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating declaration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(
        config_file
            .parent()
            .unwrap_or_else(|| std::path::Path::new(".")),
    );
    parser.load_dotenv()?;

    let config = parser.load_file(&config_file)?;

    let validator = ConfigValidator::new();
    let result = validator.validate(&config)?;

    eprintln!("Declaration is valid.");
    if show_warnings && !result.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &result.warnings {
            eprintln!("  - {warning}");
        }
    }

    eprintln!("\nDeclaration summary:");
    eprintln!("  Project: {}", config.qualified_name());
    eprintln!("  Region: {}", config.project.region);
    eprintln!("  AMI: {}", config.instance.ami);
    eprintln!("  Instance type: {}", config.instance.instance_type);
    eprintln!("  Outputs: {}", config.outputs.join(", "));

    Ok(())
}

/// Show the change plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config).await;

    let reconciler = Reconciler::new(&config, &state_store, &provider);
    let (diff, plan) = reconciler.plan().await?;

    eprintln!("{}", formatter.format_plan(&plan, &diff));

    if detailed {
        eprintln!("Detailed changes:");
        for resource_diff in diff.actionable_diffs() {
            eprintln!("  {resource_diff}");
            for detail in &resource_diff.details {
                eprintln!(
                    "    {}: {} -> {}",
                    detail.field,
                    detail.old_value.as_deref().unwrap_or("<none>"),
                    detail.new_value.as_deref().unwrap_or("<none>")
                );
            }
        }
    }

    Ok(())
}

/// Apply the declaration.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    continue_on_error: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config).await;

    let reconciler = Reconciler::new(&config, &state_store, &provider)
        .with_continue_on_error(continue_on_error);

    let (diff, plan) = reconciler.plan().await?;

    if plan.is_empty() {
        eprintln!("No changes to apply.");
        return Ok(());
    }

    eprintln!("{}", formatter.format_plan(&plan, &diff));

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ")? {
        eprintln!("Apply cancelled.");
        return Ok(());
    }

    let report = reconciler.apply().await?;
    eprintln!("\n{}", formatter.format_apply(&report));

    if report.success {
        let outputs = OutputPublisher::new().publish(&config.outputs, &report.state)?;
        eprintln!("Outputs:\n{}", formatter.format_outputs(&outputs));
    }

    Ok(())
}

/// Print published outputs.
async fn cmd_output(
    config_path: Option<&PathBuf>,
    name: Option<String>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;

    let Some(state) = state_store.load().await? else {
        return Err(GangwayError::internal(
            "No applied state found; run 'gangway apply' first",
        ));
    };

    let outputs = OutputPublisher::new().publish(&config.outputs, &state)?;

    if let Some(name) = name {
        let value = outputs.get(&name).ok_or_else(|| {
            GangwayError::internal(format!("Output '{name}' is not declared"))
        })?;
        // Raw value on stdout for scripting
        println!("{value}");
    } else {
        eprintln!("{}", formatter.format_outputs(&outputs));
    }

    Ok(())
}

/// Show the observed environment.
async fn cmd_status(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (config, _state_store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config).await;

    let view = provider
        .observe(&config.project.name, &config.project.environment)
        .await?;

    eprintln!("{}", formatter.format_status(&view));
    Ok(())
}

/// Apply, wait for readiness, and hand off the deployment.
async fn cmd_deploy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    identity: Option<PathBuf>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config).await;

    let Some(deploy_target) = config.deploy.clone() else {
        return Err(GangwayError::internal(
            "No deploy target in declaration; add a 'deploy' section",
        ));
    };

    if !auto_approve
        && !confirm("This will apply the declaration and deploy. Continue? [y/N]: ")?
    {
        eprintln!("Deploy cancelled.");
        return Ok(());
    }

    // Apply
    let reconciler = Reconciler::new(&config, &state_store, &provider);
    let report = reconciler.apply().await?;
    eprintln!("{}", formatter.format_apply(&report));

    if !report.success {
        return Err(GangwayError::internal(
            "Apply did not converge; fix the errors and re-run",
        ));
    }

    // Publish
    let outputs = OutputPublisher::new().publish(&config.outputs, &report.state)?;
    eprintln!("Outputs:\n{}", formatter.format_outputs(&outputs));

    let host = outputs
        .get(gangway_deploy_ec2::outputs::OUTPUT_PUBLIC_IP)
        .ok_or_else(|| {
            GangwayError::internal("deploy requires the ec2_public_ip output")
        })?
        .to_string();

    // Readiness gate
    let gate = ReadinessGate::from_config(&config.readiness);
    let ready = gate.wait_for_tcp(&host).await?;
    eprintln!(
        "Host ready after {} attempts ({:.1}s)",
        ready.attempts,
        ready.elapsed.as_secs_f64()
    );

    // Handoff
    let mut executor = SshRemoteExecutor::new();
    if let Some(identity) = identity {
        executor = executor.with_identity_file(identity);
    }

    let credentials = resolve_registry_credentials(&config)?;
    let handoff = HandoffNotifier::new(executor, LogNotifier::new());
    let handoff_report = handoff
        .handoff(&outputs, &deploy_target, credentials.as_ref())
        .await?;

    eprintln!(
        "Deployed {} as '{}' on {}",
        handoff_report.image, handoff_report.container_name, handoff_report.host
    );

    // Optional application probe
    if let Some(http) = &config.readiness.http {
        let probe = HttpProbe::from_config(http)?;
        let interval = std::time::Duration::from_secs(config.readiness.interval_secs);
        let timeout = std::time::Duration::from_secs(config.readiness.timeout_secs);

        match probe.wait_for_ok(&host, interval, timeout).await {
            Ok(app_ready) => eprintln!(
                "Application responding at {} after {} attempts",
                app_ready.endpoint, app_ready.attempts
            ),
            Err(e) => warn!("Application probe did not pass: {e}"),
        }
    }

    Ok(())
}

/// Destroy the environment.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config).await;

    eprintln!(
        "This will destroy every managed resource for {}.",
        config.qualified_name()
    );

    if !auto_approve {
        eprint!("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ");
        std::io::stderr().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if input.trim() != "destroy" {
            eprintln!("Destruction cancelled.");
            return Ok(());
        }
    }

    let reconciler = Reconciler::new(&config, &state_store, &provider);
    let report = reconciler.destroy().await?;

    eprintln!("{}", formatter.format_apply(&report));
    if report.success {
        eprintln!("All resources destroyed.");
    }

    Ok(())
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (_config, state_store) = load_config_and_state(config_path).await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = state_store.load().await? {
                eprintln!("{}", formatter.format_state(&state));
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Lock { holder } => {
            let holder_str = holder.as_deref().unwrap_or("");
            let lock = state_store.acquire_lock(holder_str, "manual").await?;
            eprintln!("State locked: {}", lock.lock_id);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = state_store.get_lock_info().await? {
                    state_store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                }
            } else if let Some(id) = lock_id {
                state_store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Prompts for a yes/no confirmation.
fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Resolves the declaration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads the declaration and creates the matching state store.
async fn load_config_and_state(
    config_path: Option<&PathBuf>,
) -> Result<(DeployConfig, Box<dyn StateStore>)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading declaration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(
        config_file
            .parent()
            .unwrap_or_else(|| std::path::Path::new(".")),
    );
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;

    let validator = ConfigValidator::new();
    validator.validate(&config)?;

    let state_store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config.state.path.as_ref().map_or_else(
                || {
                    config_file
                        .parent()
                        .unwrap_or_else(|| std::path::Path::new("."))
                        .join(".gangway")
                },
                PathBuf::from,
            );
            Box::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| GangwayError::internal("S3 bucket not configured"))?;
            let prefix = config.state.prefix.as_deref();
            let region = config
                .state
                .region
                .as_deref()
                .or(Some(config.project.region.as_str()));
            Box::new(S3StateStore::new(bucket, prefix, region).await?)
        }
    };

    Ok((config, state_store))
}

/// Creates the EC2 provider for the declared region.
async fn create_provider(config: &DeployConfig) -> Ec2Provisioner {
    Ec2Provisioner::new(Ec2Client::new(&config.project.region).await)
}

/// Resolves registry credentials from the declared environment names.
fn resolve_registry_credentials(config: &DeployConfig) -> Result<Option<RegistryCredentials>> {
    let Some(registry) = config.deploy.as_ref().and_then(|d| d.registry.as_ref()) else {
        return Ok(None);
    };

    let username = ConfigParser::require_env(&registry.username_env)?;
    let password = ConfigParser::require_env(&registry.password_env)?;

    Ok(Some(RegistryCredentials {
        server: registry.server.clone(),
        username,
        password,
    }))
}
