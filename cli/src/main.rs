// mixgate: command-line front end for the anonymous remailer gateway
//
// Refreshes the public remailer lists, checks the Tor proxy, and submits
// messages through a three-hop YAMN chain.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use mixgate_core::config::GatewayConfig;
use mixgate_core::dispatch::locate_executable;
use mixgate_core::registry::{LatencyClass, RefreshOutcome, RemailerEntry};
use mixgate_core::{
    ConnectivityReport, Gateway, ListKind, ProxiedFetcher, SourceRegistry, SubmissionFields,
    TorCheckGate, TorControl,
};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "mixgate")]
#[command(about = "mixgate: Anonymous email through the YAMN remailer network", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create config and data directories
    Init,
    /// Fetch fresh remailer lists through Tor
    Refresh {
        #[arg(value_enum, default_value = "all")]
        target: RefreshTarget,
        /// Ignore list age and fetch now
        #[arg(short, long)]
        force: bool,
    },
    /// Show list freshness and gateway settings
    Status,
    /// Verify that the configured proxy really exits through Tor
    CheckProxy {
        /// Ask the control port for new circuits first
        #[arg(long)]
        new_identity: bool,
    },
    /// List known remailers by chain position
    Remailers,
    /// Send a message through the remailer network
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        from: String,
        #[arg(short, long)]
        subject: String,
        /// Entry remailer name, or * for random
        #[arg(long, default_value = "*")]
        entry: String,
        /// Middle remailer name, or * for random
        #[arg(long, default_value = "*")]
        middle: String,
        /// Exit remailer name, or * for random
        #[arg(long, default_value = "*")]
        exit: String,
        #[arg(long)]
        reply_to: Option<String>,
        #[arg(long)]
        newsgroups: Option<String>,
        #[arg(long)]
        references: Option<String>,
        #[arg(short, long, default_value = "1")]
        copies: u32,
        /// Message body; read from stdin when omitted
        #[arg(short, long)]
        body: Option<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set a configuration value
    Set { key: String, value: String },
    /// Get a configuration value
    Get { key: String },
    /// List all configuration
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum RefreshTarget {
    Stats,
    Keyring,
    All,
}

impl RefreshTarget {
    fn kinds(self) -> &'static [ListKind] {
        match self {
            RefreshTarget::Stats => &[ListKind::Stats],
            RefreshTarget::Keyring => &[ListKind::Keyring],
            RefreshTarget::All => &ListKind::ALL,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let gateway_config = config.resolved()?;
    let _log_guard = init_logging(&gateway_config)?;
    debug!("Loaded configuration from {}", config::Config::config_file()?.display());

    match cli.command {
        Commands::Init => cmd_init(&gateway_config).await,
        Commands::Refresh { target, force } => cmd_refresh(&gateway_config, target, force).await,
        Commands::Status => cmd_status(&gateway_config).await,
        Commands::CheckProxy { new_identity } => {
            cmd_check_proxy(&gateway_config, new_identity).await
        }
        Commands::Remailers => cmd_remailers(&gateway_config).await,
        Commands::Send {
            to,
            from,
            subject,
            entry,
            middle,
            exit,
            reply_to,
            newsgroups,
            references,
            copies,
            body,
        } => {
            let body = match body {
                Some(body) => body,
                None => read_stdin()?,
            };
            let fields = SubmissionFields {
                to,
                from,
                subject,
                entry_remailer: entry,
                middle_remailer: middle,
                exit_remailer: exit,
                reply_to,
                newsgroups,
                references,
                body,
                copies: Some(copies),
            };
            cmd_send(&gateway_config, fields).await
        }
        Commands::Config { action } => cmd_config(config, action).await,
    }
}

/// Console logging always; the rotating file log only when opted in
/// Directive that lets dispatch outcome records through a quieter default
const OUTCOME_DIRECTIVE: &str = "mixgate::outcome=info";

fn log_filter(base: EnvFilter, log_outcomes: bool) -> Result<EnvFilter> {
    if !log_outcomes {
        return Ok(base);
    }
    let directive = OUTCOME_DIRECTIVE
        .parse()
        .context("Invalid outcome log directive")?;
    Ok(base.add_directive(directive))
}

fn init_logging(config: &GatewayConfig) -> Result<Option<WorkerGuard>> {
    let logging = &config.logging;
    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let filter = log_filter(base, config.dispatch.log_outcomes)?;
    let console = fmt::layer().with_writer(std::io::stderr);

    let directory = match logging.directory.as_deref() {
        Some(dir) if logging.enabled => dir,
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            return Ok(None);
        }
    };

    std::fs::create_dir_all(directory).context("Failed to create log directory")?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("mixgate")
        .filename_suffix("log")
        .build(directory)
        .context("Failed to open log file")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();

    Ok(Some(guard))
}

fn read_stdin() -> Result<String> {
    let mut body = String::new();
    std::io::stdin()
        .read_to_string(&mut body)
        .context("Failed to read message body from stdin")?;
    Ok(body)
}

fn open_registry(config: &GatewayConfig) -> SourceRegistry {
    SourceRegistry::new(
        config.registry.clone(),
        Arc::new(TorCheckGate::new(config.proxy.clone())),
        Arc::new(ProxiedFetcher::new(&config.proxy, &config.registry)),
    )
}

async fn cmd_init(config: &GatewayConfig) -> Result<()> {
    config.validate().context("Configuration is invalid")?;

    let paths = [
        config.registry.stats_path.parent(),
        config.registry.keyring_path.parent(),
        Some(config.registry.backup_dir.as_path()),
        Some(config.scratch.dir.as_path()),
    ];
    for dir in paths.into_iter().flatten() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    println!("{}", "mixgate initialized".green().bold());
    println!();
    println!("  {:<12} {}", "Config:".bright_cyan(), config::Config::config_file()?.display());
    println!("  {:<12} {}", "Lists:".bright_cyan(), display_parent(&config.registry.stats_path));
    println!("  {:<12} {}", "Backups:".bright_cyan(), config.registry.backup_dir.display());
    println!("  {:<12} {}", "Pool:".bright_cyan(), config.scratch.dir.display());
    println!();
    println!("Next: {} to fetch the remailer lists", "mixgate refresh".bold());

    Ok(())
}

async fn cmd_refresh(config: &GatewayConfig, target: RefreshTarget, force: bool) -> Result<()> {
    let registry = open_registry(config);
    let mut failed = false;

    for &kind in target.kinds() {
        println!("{} {}...", "Refreshing".bold(), kind);
        let outcome = if force {
            registry.force_refresh(kind).await
        } else {
            registry.refresh(kind).await
        };

        match outcome {
            Ok(RefreshOutcome::UpToDate) => {
                println!("  {} {} is up to date", "✓".green(), kind);
            }
            Ok(RefreshOutcome::Replaced { source, bytes }) => {
                println!("  {} {} bytes from {}", "✓".green(), bytes, source.dimmed());
            }
            Err(e) => {
                println!("  {} {}", "✗".red(), e);
                failed = true;
            }
        }
    }

    if failed {
        anyhow::bail!("Refresh did not complete");
    }
    Ok(())
}

async fn cmd_status(config: &GatewayConfig) -> Result<()> {
    let registry = open_registry(config);

    println!("{}", "mixgate Status".bold());
    println!();

    println!("{}", "Remailer lists:".bold());
    for kind in ListKind::ALL {
        let status = registry.status(kind);
        if status.exists {
            let age = status
                .age_hours
                .map(|h| format!("{:.1}h old", h))
                .unwrap_or_else(|| "age unknown".to_string());
            println!(
                "  {:<8} {} bytes, {} ({})",
                kind.to_string().bright_cyan(),
                status.size_bytes,
                age,
                status.last_modified.unwrap_or_default().dimmed()
            );
        } else {
            println!("  {:<8} {}", kind.to_string().bright_cyan(), "(not fetched)".dimmed());
        }
    }

    println!();
    println!("{}", "Gateway:".bold());
    println!("  {:<14} {}", "Proxy:".bright_cyan(), config.proxy.endpoint());
    println!("  {:<14} {:?}", "Tor policy:".bright_cyan(), config.proxy.policy);
    println!(
        "  {:<14} {}",
        "Relay client:".bright_cyan(),
        presence(locate_executable(&config.dispatch.yamn_path).is_some())
    );
    println!(
        "  {:<14} {}",
        "Client config:".bright_cyan(),
        presence(config.dispatch.yamn_config.is_file())
    );
    println!(
        "  {:<14} {}",
        "torsocks:".bright_cyan(),
        presence(locate_executable(&config.dispatch.torsocks_path).is_some())
    );
    println!(
        "  {:<14} {}",
        "File log:".bright_cyan(),
        if config.logging.enabled { "enabled" } else { "disabled" }
    );

    Ok(())
}

async fn cmd_check_proxy(config: &GatewayConfig, new_identity: bool) -> Result<()> {
    if new_identity {
        match TorControl::new(&config.proxy).new_identity().await {
            Ok(()) => println!("{} New circuits requested", "✓".green()),
            Err(e) => println!("{} New circuits not requested: {}", "✗".yellow(), e),
        }
    }

    println!("Checking {} ...", config.proxy.endpoint().bright_cyan());
    let gate = TorCheckGate::new(config.proxy.clone());
    let report = gate.connectivity(&config.dispatch.torsocks_path).await;
    for (label, passed) in connectivity_lines(&report) {
        let mark = if passed { "✓".green() } else { "✗".red() };
        println!("  {} {}", mark, label);
    }

    if report.is_available() {
        println!("{} Traffic exits through Tor", "✓".green());
        Ok(())
    } else {
        println!("{} Tor is not available", "✗".red());
        anyhow::bail!("Proxy check failed");
    }
}

fn connectivity_lines(report: &ConnectivityReport) -> [(&'static str, bool); 3] {
    [
        ("SOCKS proxy accepting connections", report.socks_reachable),
        ("Traffic routed through Tor", report.tor_routed),
        ("Proxy wrapper installed", report.wrapper_installed),
    ]
}

async fn cmd_remailers(config: &GatewayConfig) -> Result<()> {
    let registry = open_registry(config);
    let pool = registry
        .remailer_pool()
        .await
        .context("Remailer list is not available")?;

    if pool.is_empty() {
        println!("{}", "(no usable remailers in the current list)".dimmed());
        return Ok(());
    }

    let (middle, entry_exit): (Vec<&RemailerEntry>, Vec<&RemailerEntry>) =
        pool.entries().into_iter().partition(|e| e.is_middleman());

    println!("{} ({})", "Entry / exit remailers".bold(), entry_exit.len());
    for entry in entry_exit {
        print_remailer(entry);
    }
    println!();
    println!("{} ({})", "Middle remailers".bold(), middle.len());
    for entry in middle {
        print_remailer(entry);
    }

    Ok(())
}

fn print_remailer(entry: &RemailerEntry) {
    let latency = match entry.latency_minutes {
        Some(m) => format!("{}m", m),
        None => "?".to_string(),
    };
    let latency = match entry.latency {
        LatencyClass::Fast => latency.green(),
        LatencyClass::Moderate => latency.yellow(),
        LatencyClass::Slow => latency.red(),
        LatencyClass::Unknown => latency.dimmed(),
    };
    let uptime = entry
        .uptime_percent
        .map(|u| format!("{:.1}%", u))
        .unwrap_or_else(|| "?".to_string());
    let flags: String = entry.capabilities.iter().collect();

    println!(
        "  {:<16} {:>6} {:>7} {}",
        entry.name.bright_cyan(),
        latency,
        uptime,
        flags.dimmed()
    );
}

async fn cmd_send(config: &GatewayConfig, fields: SubmissionFields) -> Result<()> {
    let gateway = Gateway::from_config(config).context("Failed to start gateway")?;

    println!("{}", "Sending through the remailer network...".bold());
    let result = gateway.submit(&fields).await;

    if result.success {
        println!("{} Message handed to the remailer network", "✓".green());
        return Ok(());
    }

    for error in &result.errors {
        println!("  {} {}", "✗".red(), error);
    }
    anyhow::bail!("Message was not sent");
}

async fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }

            println!();
            println!("{}", config::Config::config_file()?.display().to_string().dimmed());
        }
    }

    Ok(())
}

fn presence(found: bool) -> ColoredString {
    if found {
        "found".green()
    } else {
        "missing".red()
    }
}

fn display_parent(path: &Path) -> String {
    path.parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
