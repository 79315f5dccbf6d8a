use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use policy_audit::orchestrator::wire;
use policy_audit::{
    AuditConfig, CheckerRegistry, ExecutionMode, LocalTarget, Profile, ReportBuilder,
    WorkerLauncher,
};

/// Policy audit CLI: assess a target against a profile of policies
#[derive(Parser, Debug)]
#[command(name = "policy-audit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Audit a target and print the report as JSON
    #[command(name = "audit")]
    Audit {
        #[command(flatten)]
        args: AuditArgs,
    },

    /// Assess selected policies and print the results for a parent process
    #[command(name = "worker")]
    Worker {
        #[command(flatten)]
        input: InputArgs,

        /// Policy to assess (repeatable)
        #[arg(long = "policy", required = true)]
        policies: Vec<String>,
    },

    /// List the registered check implementations
    #[command(name = "policies")]
    Policies,
}

#[derive(Parser, Debug)]
struct InputArgs {
    /// Profile YAML file
    #[arg(long)]
    profile: PathBuf,

    /// Target YAML file
    #[arg(long)]
    target: PathBuf,
}

#[derive(Parser, Debug)]
struct AuditArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run assessment batches in worker processes
    #[arg(long)]
    processes: bool,

    /// Maximum number of concurrent worker processes
    #[arg(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Some(Command::Audit { args }) => handle_audit_command(args, cli.verbose).await,
        Some(Command::Worker { input, policies }) => handle_worker_command(input, policies).await,
        Some(Command::Policies) => handle_policies_command(),
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            eprintln!("Example: policy-audit audit --profile profile.yaml --target target.yaml");
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr; stdout carries the report or worker payload.
fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_input(input: &InputArgs) -> Result<(Profile, LocalTarget)> {
    let profile = Profile::from_file(&input.profile)?;
    let target = LocalTarget::from_file(&input.target)?;
    Ok((profile, target))
}

async fn handle_audit_command(args: AuditArgs, verbose: bool) -> Result<()> {
    let (profile, target) = load_input(&args.input)?;

    let mut config = AuditConfig::load_or_default(args.config.as_deref())?;
    if args.processes {
        config.execution.mode = ExecutionMode::Processes;
    }
    if let Some(concurrency) = args.concurrency {
        config.execution.max_concurrency = concurrency;
    }

    info!("Profile: {} ({} policies)", profile.name, profile.policies.len());
    info!("Target: {}", args.input.target.display());

    let mut builder =
        ReportBuilder::new(CheckerRegistry::with_builtin()).with_config(config.execution.clone());

    if config.execution.mode == ExecutionMode::Processes {
        let program = std::env::current_exe().context("Failed to locate own executable")?;
        let mut worker_args = vec![
            "worker".to_string(),
            "--profile".to_string(),
            args.input.profile.display().to_string(),
            "--target".to_string(),
            args.input.target.display().to_string(),
        ];
        if verbose {
            worker_args.push("--verbose".to_string());
        }
        let launcher = WorkerLauncher::new(program, worker_args)
            .with_timeout(config.execution.process_timeout());
        builder = builder.with_launcher(Arc::new(launcher));
    }

    let report = builder
        .build(&profile, &target)
        .await
        .context("Report integrity check failed")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize report")?
    );

    info!(
        "Report {}: {} ({} results, severity {})",
        report.report_type(),
        if report.is_successful() { "passed" } else { "failed" },
        report.len(),
        report.severity()
    );

    if !report.is_successful() {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_worker_command(input: InputArgs, names: Vec<String>) -> Result<()> {
    let (profile, target) = load_input(&input)?;
    let policies = profile.select(&names)?;

    let builder = ReportBuilder::new(CheckerRegistry::with_builtin());
    let responses = builder.assess_policies(&policies, &target).await;

    let payload = wire::encode(&responses).context("Failed to encode worker results")?;
    println!("{}", payload);
    Ok(())
}

fn handle_policies_command() -> Result<()> {
    let registry = CheckerRegistry::with_builtin();
    for name in registry.names() {
        let checker = registry.instantiate(name)?;
        println!("{:<12} {}", name, checker.description());
    }
    Ok(())
}
