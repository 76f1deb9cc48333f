use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "poolside-cli")]
#[command(about = "Poolside timetable ingest command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, validate and store timetables, then build the projection.
    Ingest,
    /// Create the schema without ingesting anything.
    Migrate,
    /// Serve the JSON read API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = poolside_ingest::run_ingest_from_env().await?;
            println!(
                "ingest complete: sites={} facilities={} timetables={} sessions={} entries={} events={}",
                summary.sites,
                summary.facilities,
                summary.timetables,
                summary.sessions,
                summary.entries,
                summary.events
            );
        }
        Commands::Migrate => {
            // Only the database url is needed here, not the full config.
            let database_url = std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://poolside.db?mode=rwc".to_string());
            let store = poolside_ingest::Store::connect(&database_url).await?;
            store.migrate().await?;
            println!("schema ready at {database_url}");
        }
        Commands::Serve => {
            poolside_web::serve_from_env().await?;
        }
    }

    Ok(())
}
