use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use docset_publisher::services::Services;
use docset_publisher::{config, db, jobs, scheduler};

#[derive(Debug, Parser)]
#[command(author, version, about = "Process and publish documentation bundles")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run every due job and exit instead of polling forever
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let services = Services::from_config(pool, cfg)?;

    // Bundles queued while no worker was running.
    let admitted = scheduler::admit(&services.pool).await?;
    if !admitted.is_empty() {
        info!(count = admitted.len(), "admitted queued bundles at startup");
    }

    if args.once {
        let processed = jobs::run_until_idle(&services).await?;
        info!(processed, "all due jobs processed");
        return Ok(());
    }

    info!("starting job worker");
    loop {
        match jobs::process_next_job(&services).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(err) = scheduler::admit(&services.pool).await {
                    error!(%err, "admission sweep failed");
                }
                tokio::time::sleep(poll_sleep).await;
            }
            Err(err) => {
                error!(?err, "job worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
