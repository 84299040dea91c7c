use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use pasarela::config::{Config, ConfigError};
use pasarela::core::{BackendSet, BoundedPoolProvider, ProcessContext};
use pasarela::health::HealthChecker;
use pasarela::utils::format_duration;
use pasarela::Pasarela;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pasarela")]
#[command(about = "Backend pool manager for MySQL-protocol proxies")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Pasarela Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track backend health until interrupted
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Run a single health sweep and print backend and group status
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate example configuration files
    Config {
        /// Backend layout (single or grouped)
        #[arg(short, long, default_value = "single")]
        layout: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_pasarela(config).await?;
        }
        Commands::Check { config } => {
            check_backends(config).await?;
        }
        Commands::Config { layout, output } => {
            generate_config(layout, output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn process_context(config: &Config) -> ProcessContext {
    ProcessContext::new(config.pool.clone()).with_pool_provider(Arc::new(BoundedPoolProvider))
}

async fn run_pasarela(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config)?;

    info!("Starting pasarela v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!("Read-only algorithm: {:?}", config.backends.algorithm);

    let mut pasarela = Pasarela::from_config(&config, &process_context(&config))
        .context("Failed to build backend set")?;
    pasarela.start_health_checks();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown requested");
    pasarela.shutdown().await;
    print_status(pasarela.backends());
    Ok(())
}

async fn check_backends(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config)?;

    let set = BackendSet::from_config(&config, &process_context(&config))
        .context("Failed to build backend set")?;
    let checker = HealthChecker::from_config(&config.health);

    let report = checker.check(&set).await;
    println!(
        "Checked {} backends: {} marked up, {} marked down, {} held in maintenance",
        report.checked, report.marked_up, report.marked_down, report.held
    );
    print_status(&set);
    Ok(())
}

fn print_status(set: &BackendSet) {
    let now = SystemTime::now();

    println!();
    println!(
        "{:<4} {:<28} {:<8} {:<5} {:<12} {:>8} {:>10} {:<12}",
        "IDX", "ADDRESS", "GROUP", "TYPE", "STATE", "CLIENTS", "DELAY_MS", "SINCE"
    );
    for backend in set.snapshot() {
        let since = set
            .get(backend.index)
            .ok()
            .and_then(|b| now.duration_since(b.state_since()).ok())
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<4} {:<28} {:<8} {:<5} {:<12} {:>8} {:>10} {:<12}",
            backend.index,
            backend.address,
            backend.group.as_deref().unwrap_or("-"),
            backend.backend_type,
            backend.state,
            backend.connected_clients,
            backend.slave_delay_msec,
            since
        );
    }

    let groups = set.group_snapshots();
    if !groups.is_empty() {
        println!();
        for group in groups {
            println!(
                "group {}: primary {} replicas [{}]",
                group.name,
                group.master.as_deref().unwrap_or("-"),
                group.slaves.join(", ")
            );
        }
    }
}

fn generate_config(layout: String, output: PathBuf) -> anyhow::Result<()> {
    println!("Generating {} configuration file: {:?}", layout, output);

    Config::create_example_config(&output, &layout)
        .context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  pasarela run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Read-only algorithm: {:?}", config.backends.algorithm);
            println!("  Max pool size: {}", config.pool.max_conn_pool);
            println!("  Backends: {} servers", config.backends.servers.len());
            for (i, server) in config.backends.servers.iter().enumerate() {
                println!("    {}: {} ({})", i + 1, server.address, server.backend_type);
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("pasarela v{}", env!("CARGO_PKG_VERSION"));
    println!("Backend pool manager for MySQL-protocol proxies");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Read-write and read-only backend selection (round-robin, random, first)");
    println!("  • Replication groups with round-robin replica picks");
    println!("  • Concurrent health sweeps with operator-held maintenance state");
    println!("  • Per-backend authentication challenge cache");
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    // RUST_LOG takes precedence over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.logging.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
