use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;

use docset_publisher::{config, db, lifecycle, scheduler};

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and review documentation bundles")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record a webhook body (from a file, or stdin when omitted)
    Ingest {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Approve a bundle in draft for publishing
    Approve { bundle_id: i64 },
    /// Reject a bundle in draft
    Reject { bundle_id: i64 },
    /// Queue a fresh bundle for the export of a finished bundle
    Requeue { bundle_id: i64 },
    /// Admit queued bundles whose docset is free
    Admit,
    /// List recent bundles
    List {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Show a bundle with its staged changes and log
    Show { bundle_id: i64 },
    /// Print a complete example configuration
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Ingest { file } => {
            let body = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut body = String::new();
                    std::io::stdin().read_to_string(&mut body)?;
                    body
                }
            };
            let event = lifecycle::ingest_webhook(&pool, &body).await?;
            match event.bundle_id {
                Some(bundle_id) => println!(
                    "webhook {} {}: bundle {}",
                    event.id,
                    event.status.as_str(),
                    bundle_id
                ),
                None => println!("webhook {} {}", event.id, event.status.as_str()),
            }
        }
        Command::Approve { bundle_id } => {
            lifecycle::approve(&pool, bundle_id).await?;
            println!("bundle {} approved", bundle_id);
        }
        Command::Reject { bundle_id } => {
            lifecycle::reject(&pool, bundle_id).await?;
            println!("bundle {} rejected", bundle_id);
        }
        Command::Requeue { bundle_id } => {
            let new_id = lifecycle::requeue(&pool, bundle_id).await?;
            println!("bundle {} requeued as {}", bundle_id, new_id);
        }
        Command::Admit => {
            let admitted = scheduler::admit(&pool).await?;
            println!("admitted {:?}", admitted);
        }
        Command::List { limit } => {
            for b in db::list_bundles(&pool, limit).await? {
                println!(
                    "{:>6}  {:<14}  {:<20}  {}",
                    b.id,
                    b.status.as_str(),
                    b.docset_id,
                    b.error_message.as_deref().unwrap_or("")
                );
            }
        }
        Command::Show { bundle_id } => {
            let bundle = db::fetch_bundle(&pool, bundle_id)
                .await?
                .ok_or_else(|| anyhow!("bundle {} not found", bundle_id))?;
            println!("{}", serde_json::to_string_pretty(&bundle)?);
            if let Some(docset) = db::fetch_docset(&pool, &bundle.docset_id).await? {
                println!("docset: {} ({})", docset.display_name, docset.docset_id);
            }
            println!("articles:");
            for a in db::list_articles(&pool, bundle_id).await? {
                println!("  {:<8} {:<40} {}", a.status.as_str(), a.url_slug, a.title);
            }
            println!("images:");
            for i in db::list_images(&pool, bundle_id).await? {
                println!("  {:<8} {}", i.status.as_str(), i.relative_path);
            }
            println!("log:");
            for l in db::list_bundle_logs(&pool, bundle_id).await? {
                println!("  {} {:<5} {}", l.created_at.to_rfc3339(), l.level, l.message);
            }
        }
        Command::ExampleConfig => {}
    }
    Ok(())
}
