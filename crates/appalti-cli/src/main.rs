use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use appalti_adapters::SourceError;
use appalti_import::{ErrorPolicy, ImportConfig, ImportPipeline};
use clap::{Parser, Subcommand};
use sqlx::{Connection, PgConnection};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "appalti-cli")]
#[command(about = "Portale Appalti notice importer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import a notice file, or every `*.json` file of a directory, in one transaction.
    Import {
        #[arg(long, short)]
        input: PathBuf,
        /// `abort` rolls back the batch on the first failure, `skip` drops only the failing document.
        #[arg(long)]
        on_error: Option<ErrorPolicy>,
        /// Run the whole batch, then roll back.
        #[arg(long)]
        dry_run: bool,
        /// YAML file with extra free-text to code entries.
        #[arg(long)]
        code_maps: Option<PathBuf>,
    },
    /// Print the row count of every table.
    Counts,
}

const EXIT_INPUT: u8 = 1;
const EXIT_BATCH_FAILED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let mut config = ImportConfig::from_env()?;
    match command {
        Commands::Import {
            input,
            on_error,
            dry_run,
            code_maps,
        } => {
            if let Some(policy) = on_error {
                config.on_error = policy;
            }
            config.dry_run |= dry_run;
            if code_maps.is_some() {
                config.code_maps_path = code_maps;
            }
            let pipeline = ImportPipeline::new(config)?;
            let summary = pipeline.run(&input).await?;
            if summary.committed {
                info!(run_id = %summary.run_id, "batch committed");
            } else {
                info!(run_id = %summary.run_id, "dry run rolled back");
            }
            println!(
                "import complete: run_id={} documents={} imported={} skipped={} lots={} committed={}",
                summary.run_id,
                summary.documents_seen,
                summary.documents_imported,
                summary.documents_skipped,
                summary.lots_written,
                summary.committed
            );
        }
        Commands::Counts => {
            let options = config.database.connect_options()?;
            let mut conn = PgConnection::connect_with(&options)
                .await
                .with_context(|| format!("connecting to {}", config.database.display_target()))?;
            let counts = appalti_storage::row_counts(&mut conn).await.context("counting rows")?;
            conn.close().await.context("closing database connection")?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }
    Ok(())
}

/// Problems found before any database work map to 1, everything later to 2.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    let before_batch = err.chain().any(|cause| {
        matches!(cause.downcast_ref::<SourceError>(), Some(SourceError::NotFound(_)))
            || cause.downcast_ref::<appalti_import::UnknownErrorPolicy>().is_some()
    });
    if before_batch {
        EXIT_INPUT
    } else {
        EXIT_BATCH_FAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_flags_parse() {
        let cli = Cli::try_parse_from([
            "appalti-cli",
            "import",
            "--input",
            "notices/",
            "--on-error",
            "skip",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Import {
                input,
                on_error,
                dry_run,
                code_maps,
            } => {
                assert_eq!(input, PathBuf::from("notices/"));
                assert_eq!(on_error, Some(ErrorPolicy::SkipDocument));
                assert!(dry_run);
                assert_eq!(code_maps, None);
            }
            Commands::Counts => panic!("expected import"),
        }
    }

    #[test]
    fn unknown_policy_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["appalti-cli", "import", "-i", "x.json", "--on-error", "retry"]).is_err());
    }

    #[test]
    fn missing_input_maps_to_exit_one() {
        let err = anyhow::Error::new(SourceError::NotFound(PathBuf::from("nope")));
        assert_eq!(exit_code_for(&err), EXIT_INPUT);
        let wrapped = err.context("opening input");
        assert_eq!(exit_code_for(&wrapped), EXIT_INPUT);
    }

    #[test]
    fn other_failures_map_to_exit_two() {
        let err = anyhow::anyhow!("constraint violated on lotto");
        assert_eq!(exit_code_for(&err), EXIT_BATCH_FAILED);
    }
}
