use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "fplm-cli")]
#[command(about = "Fantasy Premier League season mirror")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental sync pass against the remote season database.
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = fplm_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} resume_from=GW{} latest=GW{} gameweeks={} skipped={} files={}",
                summary.run_id,
                summary.resume_from,
                summary.latest_gameweek,
                summary.gameweeks_processed,
                summary.gameweeks_skipped,
                summary.files_written
            );
        }
    }

    Ok(())
}
