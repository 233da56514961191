use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ukft_sync::{clean_records, validate_database, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "ukft-cli")]
#[command(about = "UK research funding tracker")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect from every enabled source and merge into the database.
    Update {
        /// Only these source ids, e.g. `--sources ukri,academies`.
        #[arg(long, num_args = 1.., value_delimiter = ',')]
        sources: Vec<String>,
    },
    /// Check the stored database without modifying it.
    Validate,
    /// Delete individual record files older than the given age.
    Clean {
        #[arg(long, default_value_t = 30)]
        days: u64,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let command = cli.command.unwrap_or(Commands::Update {
        sources: Vec::new(),
    });
    match run(command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = ?err, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<bool> {
    let config = SyncConfig::from_env();

    match command {
        Commands::Update { sources } => {
            let summary = SyncPipeline::new(config).run_once(&sources).await?;
            println!(
                "update complete: run_id={} collected={} added={} duplicates={} invalid={} total={} persisted={}",
                summary.run_id,
                summary.collected_schemes,
                summary.merge.added,
                summary.merge.duplicates,
                summary.merge.invalid,
                summary.total_fundings,
                summary.persisted
            );
            if !summary.sources_failed.is_empty() {
                println!("failed sources: {}", summary.sources_failed.join(", "));
            }
            Ok(summary.succeeded())
        }
        Commands::Validate => {
            let report = validate_database(&config.store())?;
            println!(
                "validation: {}/{} valid, declared total {}, duplicate ids {}",
                report.valid_records,
                report.total_records,
                report.declared_total,
                report.duplicate_ids.len()
            );
            for invalid in &report.invalid {
                println!(
                    "  {}: {}",
                    invalid.id.as_deref().unwrap_or("<no id>"),
                    invalid.reason
                );
            }
            Ok(report.is_ok())
        }
        Commands::Clean { days } => {
            let removed = clean_records(&config, days)?;
            info!(removed, days, "clean complete");
            println!("removed {removed} record files older than {days} days");
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_is_the_default_command() {
        let cli = Cli::try_parse_from(["ukft-cli"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn update_accepts_comma_separated_sources() {
        let cli = Cli::try_parse_from(["ukft-cli", "-v", "update", "--sources", "ukri,academies"])
            .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Some(Commands::Update { sources }) => assert_eq!(sources, vec!["ukri", "academies"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn clean_defaults_to_thirty_days() {
        let cli = Cli::try_parse_from(["ukft-cli", "clean"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Clean { days: 30 })));
        let cli = Cli::try_parse_from(["ukft-cli", "clean", "--days", "7"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Clean { days: 7 })));
    }
}
