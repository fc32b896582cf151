use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use meetup_sync::config;
use meetup_sync::db;
use meetup_sync::sync::{RunSummary, SyncEngine};

#[derive(Debug, Parser)]
#[command(author, version, about = "Mirror meetup.com groups and members into SQLite and a warehouse")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sync the category list
    Categories,
    /// Discover groups through the active filters and upload them
    Groups,
    /// Sync members of every group that is due
    Members,
    /// Groups, then members
    All,
    /// Run `all` forever, pausing `app.run_interval_seconds` between runs
    Daemon,
    /// Track groups of a category around a location
    AddFilter {
        #[arg(long)]
        category_id: i64,
        #[arg(long)]
        country: String,
        #[arg(long)]
        location: String,
    },
    /// Enable or disable a filter
    SetFilter {
        id: i64,
        #[arg(long, action = clap::ArgAction::Set)]
        active: bool,
    },
    /// List stored filters
    Filters,
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

    let engine = || SyncEngine::from_config(&cfg, pool.clone());
    match args.command {
        Command::Categories => {
            engine()?.sync_categories().await?;
        }
        Command::Groups => {
            let report = engine()?.sync_groups().await?;
            info!(groups = report.groups, upload = ?report.upload, "groups synced");
        }
        Command::Members => print_summary(&engine()?.sync_due_members().await?)?,
        Command::All => run_all(&engine()?).await?,
        Command::Daemon => {
            let engine = engine()?;
            let pause = Duration::from_secs(cfg.app.run_interval_seconds);
            info!(interval = ?pause, "starting sync daemon");
            loop {
                if let Err(err) = run_all(&engine).await {
                    error!(?err, "sync run failed");
                }
                tokio::time::sleep(pause).await;
            }
        }
        Command::AddFilter {
            category_id,
            country,
            location,
        } => {
            let location_id = db::get_or_create_location(&pool, &country, &location).await?;
            let id = db::insert_filter(&pool, category_id, location_id)
                .await
                .context("failed to store filter; sync categories first")?;
            info!(id, category_id, %country, %location, "filter active");
        }
        Command::SetFilter { id, active } => {
            if !db::set_filter_active(&pool, id, active).await? {
                bail!("no filter with id {id}");
            }
            info!(id, active, "filter updated");
        }
        Command::Filters => {
            for filter in db::list_filters(&pool).await? {
                println!("{:>4}  {filter}", filter.id);
            }
        }
    }
    Ok(())
}

async fn run_all(engine: &SyncEngine) -> Result<()> {
    print_summary(&engine.run_all().await?)
}

fn print_summary(summary: &RunSummary) -> Result<()> {
    println!("{}", serde_json::to_string(summary)?);
    for failure in &summary.failed {
        error!(urlname = %failure.urlname, error = %failure.error, "target failed");
    }
    Ok(())
}
