use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gdt")]
#[command(about = "Grant deadline tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full acquisition pipeline once and write the snapshot.
    Track,
    /// Render a markdown brief from the current snapshot.
    Report,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Track) {
        Commands::Track => {
            let output = gdt_pipeline::run_track_once_from_env().await?;
            let summary = &output.summary;
            println!(
                "track complete: run_id={} baseline={} collected={} merged={} urgent={} upcoming={} future={} snapshot={}",
                summary.run_id,
                summary.baseline_records,
                summary.collected_records,
                summary.merged_records,
                summary.urgent,
                summary.upcoming,
                summary.future,
                summary.snapshot_path
            );
        }
        Commands::Report => {
            let brief = gdt_pipeline::report_from_env().await?;
            println!("{brief}");
        }
    }

    Ok(())
}
