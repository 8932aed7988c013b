use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use leaderd::{Cli, Settings};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::resolve(&cli)?;
    info!(
        id = %cli.id,
        backend = ?settings.backend,
        key = %settings.election.key,
        "leaderd starting"
    );

    let service = leaderd::connect(&settings).await?;
    let participant = leaderd::participant(&cli.id, &settings, service)?;

    let stop = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    leaderd::run(&participant, Duration::from_secs(settings.duration_secs), stop).await?;
    info!("leaderd stopped");
    Ok(())
}
