use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duocall_server::{build_router, config::Config, storage::Storage, AppState};

/// DuoCall Server CLI
#[derive(Parser)]
#[command(name = "duocall-server")]
#[command(about = "Coordination server for random one-to-one calls")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Run {
        /// Keep all state in memory instead of the configured database
        #[arg(long)]
        ephemeral: bool,
    },

    /// Run one cleanup pass and exit
    Cleanup,

    /// Print queue and call statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "duocall_server=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load config
    let config = Config::load(&cli.config).await?;
    let config = Arc::new(config);

    match cli.command.unwrap_or(Commands::Run { ephemeral: false }) {
        Commands::Run { ephemeral } => {
            run_server(config, ephemeral).await?;
        }
        Commands::Cleanup => {
            let storage = Arc::new(Storage::new(&config.storage.database_path).await?);
            AppState::new(config, storage).run_cleanup().await?;
        }
        Commands::Stats => {
            print_stats(&config).await?;
        }
    }

    Ok(())
}

async fn print_stats(config: &Config) -> anyhow::Result<()> {
    let storage = Storage::new(&config.storage.database_path).await?;
    let stats = storage.get_stats().await?;

    println!("=== DuoCall Statistics ===");
    println!("Waiting requests:   {}", stats.waiting_requests);
    println!("Matched requests:   {}", stats.matched_requests);
    println!("Cancelled requests: {}", stats.cancelled_requests);
    println!("Active calls:       {}", stats.active_calls);
    println!("Ended calls:        {}", stats.ended_calls);

    Ok(())
}

async fn run_server(config: Arc<Config>, ephemeral: bool) -> anyhow::Result<()> {
    tracing::info!("Starting DuoCall Server v{}", env!("CARGO_PKG_VERSION"));

    let storage = if ephemeral {
        tracing::warn!("Running with in-memory storage; state is lost on exit");
        Arc::new(Storage::in_memory().await?)
    } else {
        Arc::new(Storage::new(&config.storage.database_path).await?)
    };

    let state = AppState::new(config.clone(), storage);
    let state_for_cleanup = state.clone();
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;

    // Start cleanup task
    let cleanup_interval = config.storage.cleanup_interval_minutes.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(cleanup_interval * 60));
        loop {
            interval.tick().await;
            if let Err(e) = state_for_cleanup.run_cleanup().await {
                tracing::error!("Cleanup failed: {}", e);
            }
        }
    });

    axum::serve(listener, app).await?;

    Ok(())
}
