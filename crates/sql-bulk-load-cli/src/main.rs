//! sql-bulk-load CLI - load JSON Lines records into a SQL table.

use clap::{Parser, Subcommand};
use sql_bulk_load::{Config, LoadError, LoadPreview, LoadResult, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "sql-bulk-load")]
#[command(about = "Transactional bulk loading into PostgreSQL, MySQL and SQL Server")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to state file for resume and cleanup
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Begin a new load transaction and run it to completion
    Run {
        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Finish the transaction recorded in the state file
    Resume,

    /// Drop the intermediate tables of the transaction in the state file
    Cleanup,

    /// Validate the configuration and show what a run would do
    Validate,

    /// Test the destination connection
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), LoadError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Validate => {
            let preview = LoadPreview::from_config(&config.with_auto_tuning());
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&preview)?);
            } else {
                println!("Configuration is valid.");
                println!("  Destination: {} ({})", preview.table, preview.driver);
                println!("  Mode: {}", preview.mode);
                println!("  Workers: {} (page size {})", preview.workers, preview.page_size);
                println!("  Batch size: {} bytes", preview.batch_size);
                println!("  Load tables: {}", preview.load_tables);
                println!("  Commit: {}", preview.commit);
                println!("  Resumable: {}", if preview.resumable { "yes" } else { "no" });
                println!("  Retry limit: {}", preview.retry_limit);
            }
        }

        Commands::Run { workers } => {
            if let Some(w) = workers {
                config.input.workers = Some(w);
            }
            config.validate()?;
            let cancel_token = setup_signal_handler();

            let mut orchestrator = Orchestrator::new(config.with_auto_tuning()).await?;
            if let Some(ref path) = cli.state_file {
                orchestrator = orchestrator.with_state_file(path.clone());
            }

            let result = orchestrator.run(cancel_token).await?;
            print_result(&result, "Load completed!", cli.output_json)?;
        }

        Commands::Resume => {
            let state_file = required_state_file(cli.state_file, "resume")?;
            let cancel_token = setup_signal_handler();

            let orchestrator = Orchestrator::new(config.with_auto_tuning())
                .await?
                .with_state_file(state_file);
            info!("Resuming from previous state");

            let result = orchestrator.resume(cancel_token).await?;
            print_result(&result, "Load resumed and completed!", cli.output_json)?;
        }

        Commands::Cleanup => {
            let state_file = required_state_file(cli.state_file, "cleanup")?;
            let orchestrator = Orchestrator::new(config).await?.with_state_file(state_file);
            orchestrator.cleanup().await?;
            println!("Cleanup completed successfully");
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config).await?;
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Destination ({}): {} ({}ms)",
                    result.dialect,
                    if result.connected { "OK" } else { "FAILED" },
                    result.latency_ms
                );
                if let Some(ref err) = result.error {
                    println!("    Error: {}", err);
                }
                if result.connected {
                    println!(
                        "  Output table: {}",
                        if result.table_exists { "exists" } else { "will be created" }
                    );
                }
            }

            if !result.connected {
                return Err(LoadError::pool("Health check failed", "health-check"));
            }
        }
    }

    Ok(())
}

fn required_state_file(state_file: Option<PathBuf>, command: &str) -> Result<PathBuf, LoadError> {
    let state_file = state_file.ok_or_else(|| {
        LoadError::Config(format!("--state-file is required for {}", command))
    })?;
    if !state_file.exists() {
        return Err(LoadError::Config(format!(
            "State file not found: {:?}",
            state_file
        )));
    }
    Ok(state_file)
}

fn print_result(result: &LoadResult, headline: &str, json: bool) -> Result<(), LoadError> {
    if json {
        println!("{}", result.to_json()?);
        return Ok(());
    }
    println!("\n{}", headline);
    println!("  Run ID: {}", result.run_id);
    println!("  Table: {} ({})", result.table, result.mode);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!("  Workers: {}", result.workers);
    println!("  Rows: {}", result.rows_loaded);
    println!("  Throughput: {} rows/sec", result.rows_per_second);
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM. Workers stop, and the
/// intermediate tables are kept for `resume` when a state file is in use.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Shutting down gracefully...", name);
                    token.cancel();
                });
            }
            Err(e) => eprintln!("Cannot listen for {}: {}", name, e),
        }
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });

    cancel_token
}
