use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use g2_provision::{
    config::ApConfig,
    credentials, identity,
    pipeline::ProvisioningOrchestrator,
    runner::SystemRunner,
    store::ConfigStore,
    supervisor::SystemdSupervisor,
    verify::VerificationEngine,
};

#[derive(Parser)]
#[command(name = "g2-provision")]
#[command(about = "Provision a wireless interface as the G2 tablet access point")]
#[command(version)]
struct Cli {
    /// Interface to provision as the access point
    #[arg(short, long, global = true)]
    interface: Option<String>,

    /// Uplink interface AP clients must not reach
    #[arg(short, long, global = true)]
    uplink: Option<String>,

    /// Configuration file (TOML) overriding the built-in defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root directory for all written system files (testing/rehearsal)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Re-provision even if a completed run is already recorded
    #[arg(short, long)]
    force: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the verification checks without re-provisioning
    Verify,

    /// Show daemon liveness and the last provisioning report
    Status,

    /// Print the credentials derived from the interface hardware address
    Credentials,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    // Keep the file-writer guard alive for the whole run.
    let _guard = init_logging(&cfg);

    let store = match &cli.root {
        Some(root) => ConfigStore::new(root),
        None => ConfigStore::system(),
    };

    let result = match cli.command {
        None => cmd_provision(&cfg, &store, cli.force),
        Some(Commands::Verify) => cmd_verify(&cfg, &store),
        Some(Commands::Status) => cmd_status(&cfg, &store),
        Some(Commands::Credentials) => cmd_credentials(&cfg, &store),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<ApConfig> {
    let mut cfg = ApConfig::load(cli.config.as_deref())?;
    if let Some(interface) = &cli.interface {
        cfg.interface = interface.clone();
    }
    if let Some(uplink) = &cli.uplink {
        cfg.uplink = Some(uplink.clone());
    }
    Ok(cfg)
}

/// Stdout plus a durable file under the configured log directory. A log
/// directory that cannot be created degrades to stdout-only.
fn init_logging(cfg: &ApConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer().with_target(false);

    if std::fs::create_dir_all(&cfg.log_dir).is_ok() {
        let appender = tracing_appender::rolling::never(&cfg.log_dir, "g2-provision.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(writer);
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout)
            .with(file)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(filter).with(stdout).init();
        None
    }
}

fn cmd_provision(cfg: &ApConfig, store: &ConfigStore, force: bool) -> Result<()> {
    use g2_provision::pipeline::COMPLETION_MARKER_RESOURCE;
    if !force && store.exists(COMPLETION_MARKER_RESOURCE) {
        println!(
            "Provisioning already completed ({} present); use --force to re-run.",
            store.path(COMPLETION_MARKER_RESOURCE).display()
        );
        return Ok(());
    }

    info!("Provisioning access point on {}", cfg.interface);
    let runner = SystemRunner;
    let supervisor = SystemdSupervisor::new(&runner);

    let mut orchestrator = ProvisioningOrchestrator::new(cfg, &runner, store, &supervisor);
    let report = orchestrator.run()?;

    if report.succeeded() {
        info!("Provisioning complete");
    } else {
        info!("Provisioning complete with non-fatal step failures");
    }
    Ok(())
}

fn cmd_verify(cfg: &ApConfig, store: &ConfigStore) -> Result<()> {
    let runner = SystemRunner;
    let supervisor = SystemdSupervisor::new(&runner);

    let report =
        VerificationEngine::new(&runner, store, &supervisor).run(cfg, Duration::ZERO);

    println!("{:<20} {:<9} {}", "CHECK", "STATUS", "DETAIL");
    println!("{}", "-".repeat(60));
    for check in &report.checks {
        let status = match (check.passed, check.critical) {
            (true, _) => "ok",
            (false, true) => "FAILED",
            (false, false) => "warning",
        };
        println!("{:<20} {:<9} {}", check.name, status, check.detail);
    }
    println!();
    println!(
        "{} critical failure(s), dns {}, {} client(s) served",
        report.critical_failures,
        if report.dns_working { "working" } else { "degraded" },
        report.clients_served
    );

    if report.succeeded() {
        Ok(())
    } else {
        Err(g2_provision::ProvisionError::VerificationFailed(report.critical_failures).into())
    }
}

fn cmd_status(cfg: &ApConfig, store: &ConfigStore) -> Result<()> {
    let runner = SystemRunner;
    let supervisor = SystemdSupervisor::new(&runner);

    use g2_provision::supervisor::ProcessSupervisor;
    println!("{:<16} {}", "DAEMON", "STATE");
    println!("{}", "-".repeat(30));
    for process in ["hostapd", "dnsmasq", "nginx"] {
        let state = if supervisor.is_running(process) { "running" } else { "stopped" };
        println!("{:<16} {}", process, state);
    }

    let report_resource = format!(
        "{}/report.json",
        cfg.log_dir.to_string_lossy().trim_start_matches('/')
    );
    println!();
    match store.read(&report_resource)? {
        Some(json) => {
            println!("Last provisioning report:");
            println!("{}", json);
        }
        None => println!("No provisioning report found; the pipeline has not run."),
    }
    Ok(())
}

fn cmd_credentials(cfg: &ApConfig, store: &ConfigStore) -> Result<()> {
    let runner = SystemRunner;
    let identity = identity::read_identity(&runner, store, &cfg.interface)?;
    let creds = credentials::derive(&identity)?;

    println!("Interface:  {}", identity.interface);
    println!("MAC:        {}", identity.hardware_address);
    println!("SSID:       {}", creds.ssid);
    println!("Passphrase: {}", creds.passphrase);
    Ok(())
}
