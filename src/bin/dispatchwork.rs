//! Operator tool for dispatchwork deployments.
//!
//! Usage:
//!   dispatchwork check-config --config dispatchwork.toml
//!   dispatchwork init-config --output dispatchwork.toml --preset production
//!   dispatchwork migrate
//!   dispatchwork stats --window 1h
//!   dispatchwork dead-letters --limit 20
//!   dispatchwork recover --older-than 30m
//!
//! Without `--config` the configuration comes from `DISPATCHWORK_*` environment
//! variables. Store commands need the `postgres` feature.

use clap::{Parser, Subcommand, ValueEnum};
use dispatchwork::{
    DispatchConfig, JobStatus, JobStore, Result,
    config::{LoggingConfig, parse_duration},
    init_logging,
};
use std::{path::PathBuf, process, sync::Arc, time::Duration};
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "dispatchwork",
    version,
    about = "Dispatchwork job queue management tool"
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Print machine-readable JSON")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Validate the configuration and print it")]
    CheckConfig,

    #[command(about = "Write a configuration file from a preset")]
    InitConfig {
        #[arg(long, value_name = "FILE")]
        output: PathBuf,

        #[arg(long, value_enum, default_value_t = Preset::Default)]
        preset: Preset,
    },

    #[command(about = "Create the job and dead-letter tables")]
    Migrate,

    #[command(about = "Show job counts and processing statistics")]
    Stats {
        #[arg(long, value_name = "DURATION", value_parser = duration_arg, help = "Statistics window, e.g. 15m or 1h")]
        window: Option<Duration>,
    },

    #[command(about = "List dead-lettered jobs, newest first")]
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    #[command(about = "Return jobs stuck in processing to pending")]
    Recover {
        #[arg(long, value_name = "DURATION", value_parser = duration_arg, help = "Claim age after which a job counts as stuck")]
        older_than: Duration,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Default,
    Development,
    Production,
}

fn duration_arg(s: &str) -> std::result::Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            let _ = init_logging(&LoggingConfig::default());
            error!(error = %e, "failed to load configuration");
            eprintln!("❌ Error: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("⚠️  Logging disabled: {}", e);
    }

    if let Err(e) = run(cli.command, config, cli.json).await {
        error!(error = %e, "command failed");
        eprintln!("❌ Error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<DispatchConfig> {
    match path {
        Some(path) => DispatchConfig::from_file(path),
        None => DispatchConfig::from_env(),
    }
}

async fn run(command: Command, config: DispatchConfig, json: bool) -> Result<()> {
    match command {
        Command::CheckConfig => {
            config.validate()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("✅ Configuration is valid\n");
                println!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(())
        }
        Command::InitConfig { output, preset } => {
            let config = match preset {
                Preset::Default => DispatchConfig::default(),
                Preset::Development => DispatchConfig::development(),
                Preset::Production => DispatchConfig::production(),
            };
            config.save_to_file(&output)?;
            println!("✅ Wrote {}", output.display());
            Ok(())
        }
        Command::Migrate => {
            config.validate()?;
            open_store(&config, true).await?;
            println!("✅ Tables are up to date");
            Ok(())
        }
        Command::Stats { window } => {
            let store = open_store(&config, false).await?;
            let window = window.unwrap_or(config.worker.metrics_window);
            let metrics = store.metrics(window).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
                return Ok(());
            }
            println!("📊 Queue statistics (window {:?})", window);
            println!("================");
            for status in JobStatus::all() {
                println!("{:<12} {}", status.as_str(), metrics.count(status));
            }
            println!("{:<12} {}", "dead-letter", metrics.dead_lettered);
            println!();
            println!(
                "completed {} / failed {} in window, error rate {:.2}%",
                metrics.completed_in_window,
                metrics.failed_in_window,
                metrics.error_rate * 100.0
            );
            println!(
                "processing time avg {:.0}ms, p50 {:.0}ms, p95 {:.0}ms, p99 {:.0}ms",
                metrics.avg_processing_time_ms,
                metrics.p50_processing_time_ms,
                metrics.p95_processing_time_ms,
                metrics.p99_processing_time_ms
            );
            Ok(())
        }
        Command::DeadLetters { limit } => {
            let store = open_store(&config, false).await?;
            let records = store.dead_letters(limit).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }
            if records.is_empty() {
                println!("🎉 No dead-lettered jobs");
                return Ok(());
            }
            for record in &records {
                println!(
                    "{} {} {} failures={} {}",
                    record.created_at.to_rfc3339(),
                    record.job_id,
                    record.job_type,
                    record.failure_count,
                    record.error_message
                );
            }
            Ok(())
        }
        Command::Recover { older_than } => {
            let store = open_store(&config, false).await?;
            let recovered = store.requeue_stale(older_than).await?;
            info!(count = recovered.len(), ?older_than, "recovery sweep finished");

            if json {
                println!("{}", serde_json::to_string_pretty(&recovered)?);
            } else {
                println!("🔧 Requeued {} stale job(s)", recovered.len());
                for job_id in recovered {
                    println!("  {}", job_id);
                }
            }
            Ok(())
        }
    }
}

#[cfg(feature = "postgres")]
async fn open_store(config: &DispatchConfig, create_tables: bool) -> Result<Arc<dyn JobStore>> {
    let store = dispatchwork::PostgresJobStore::connect(
        &config.database.url,
        config.database.pool_size,
        Duration::from_secs(config.database.connection_timeout_secs),
    )
    .await?;
    if create_tables || config.database.create_tables {
        store.create_tables().await?;
    }
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_store(_config: &DispatchConfig, _create_tables: bool) -> Result<Arc<dyn JobStore>> {
    Err(dispatchwork::DispatchError::Config(
        "this command needs a database; rebuild with --features postgres".to_string(),
    ))
}
