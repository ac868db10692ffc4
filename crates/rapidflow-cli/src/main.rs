//! RapidFlow CLI.

use clap::{Parser, Subcommand};
use rapidflow_db::Store;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "rapidflow")]
#[command(about = "Self-hosted CI/CD engine", long_about = None)]
struct Cli {
    /// SQLite database URL
    #[arg(
        long,
        env = "RAPIDFLOW_DATABASE_URL",
        default_value = "sqlite://rapidflow.db"
    )]
    database_url: String,

    /// Directory holding installer scripts for the fallback image
    #[arg(long, env = "RAPIDFLOW_SCRIPTS_DIR", default_value = "scripts")]
    scripts_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job engine: poll for pending jobs and execute them
    Serve,
    /// Run a pipeline from a configuration file and wait for it to finish
    Run {
        /// Path to the configuration file (JSON, YAML or KDL)
        path: String,
    },
    /// Stop a pipeline: cancel its jobs and reclaim containers and temp dirs
    Stop {
        /// Pipeline id
        #[arg(long)]
        id: i64,
    },
    /// Manage pipelines
    Pipelines {
        #[command(subcommand)]
        command: PipelineCommands,
    },
}

#[derive(Subcommand)]
enum PipelineCommands {
    /// List all pipelines
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let pool = rapidflow_db::create_pool(&cli.database_url).await?;
    rapidflow_db::run_migrations(&pool).await?;
    let store = Store::new(pool);

    match cli.command {
        Commands::Serve => commands::serve(store, &cli.scripts_dir).await,
        Commands::Run { path } => commands::run_file(store, &cli.scripts_dir, &path).await,
        Commands::Stop { id } => commands::stop(store, id).await,
        Commands::Pipelines {
            command: PipelineCommands::List,
        } => commands::list_pipelines(store).await,
    }
}
