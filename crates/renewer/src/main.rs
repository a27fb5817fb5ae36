//! certwarden - main entry point
//!
//! Renews TLS certificates over ACME DNS-01 and rotates them on Hetzner
//! Cloud load balancers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use certwarden::acme::{leaf_not_after, CertificateLedger, RenewalDecision};
use certwarden::{RenewalOrchestrator, RenewalScheduler};
use certwarden_common::{init_tracing, LogFormat};
use certwarden_config::{load_requests, validate_settings, Settings};

/// certwarden - ACME DNS-01 certificate renewal for cloud load balancers
#[derive(Parser, Debug)]
#[command(name = "certwarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding requests, ledgers and DNS credentials
    #[arg(short = 'd', long = "data-dir", env = "CERTWARDEN_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format: json, pretty or compact
    #[arg(long = "log-format", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run renewal cycles on the configured interval (default)
    Run,
    /// Run exactly one renewal cycle and exit
    Renew,
    /// Validate settings and the request file, list ledger state and exit
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::from_env().context("Failed to read settings from environment")?;
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = data_dir;
    }
    if let Some(format) = cli.log_format {
        settings.log_format = format;
    }
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        settings.log_level.clone()
    };
    init_tracing(&log_level, settings.log_format).context("Failed to initialize logging")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => check(&settings),
        Commands::Renew => renew_once(&settings),
        Commands::Run => run_scheduler(&settings),
    }
}

/// Validate configuration and report ledger state
fn check(settings: &Settings) -> Result<()> {
    let paths = settings.paths();
    info!(data_dir = %paths.data_dir.display(), "Checking configuration");

    let result = validate_settings(settings, false);
    for warning in &result.warnings {
        warn!(warning = %warning, "Configuration warning");
    }
    if !result.is_valid() {
        for error in &result.errors {
            eprintln!("error: {}", error);
        }
        bail!("settings have {} error(s)", result.errors.len());
    }

    // Parsing also runs the per-entry and cross-request checks.
    let requests = load_requests(&paths.requests).context("Invalid certificate requests")?;

    let mut ledger = CertificateLedger::new(&paths.certificates, &paths.certificates_backup);
    if let Err(e) = ledger.load() {
        if !e.is_not_found() {
            warn!(error = %e, "Certificate ledger unreadable");
        }
    }

    let now = Utc::now();
    for request in &requests {
        let name = request.logical_name();
        let existing = ledger.get(&name);
        let expires = existing
            .and_then(|r| leaf_not_after(&r.bundle.certificate).ok())
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let status = match RenewalDecision::evaluate(existing, now) {
            RenewalDecision::Issue => "missing".to_string(),
            RenewalDecision::Renew { due_since } => format!("due since {}", due_since.to_rfc3339()),
            RenewalDecision::Skip { next_update } => format!("next update {}", next_update.to_rfc3339()),
        };
        println!(
            "{:<24} {:<40} expires {:<26} {}",
            name,
            request.domains().join(","),
            expires,
            status
        );
    }

    println!(
        "certwarden: {} request(s) in {} are valid",
        requests.len(),
        paths.requests.display()
    );
    Ok(())
}

/// Run one cycle and exit non-zero if anything failed
fn renew_once(settings: &Settings) -> Result<()> {
    let orchestrator = RenewalOrchestrator::from_settings(settings)
        .context("Failed to set up renewal")?;

    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(orchestrator.run_cycle());

    if let Some(reason) = &report.aborted {
        bail!("renewal cycle aborted while {}: {}", report.phase, reason);
    }
    if !report.is_clean() {
        bail!(
            "renewal cycle finished with {} issuance failure(s) and {} rotation failure(s)",
            report.failed.len(),
            report.rotations.iter().filter(|o| !o.is_complete()).count()
        );
    }
    Ok(())
}

/// Run the scheduler until SIGINT or SIGTERM
fn run_scheduler(settings: &Settings) -> Result<()> {
    let result = validate_settings(settings, true);
    for warning in &result.warnings {
        warn!(warning = %warning, "Configuration warning");
    }
    if !result.is_valid() {
        let errors: Vec<String> = result.errors.iter().map(ToString::to_string).collect();
        bail!("invalid settings: {}", errors.join("; "));
    }

    let orchestrator = Arc::new(
        RenewalOrchestrator::from_settings(settings).context("Failed to set up renewal")?,
    );
    let scheduler = RenewalScheduler::new(orchestrator, settings.check_interval());

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(scheduler.run(shutdown_signal()));

    info!("certwarden stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
