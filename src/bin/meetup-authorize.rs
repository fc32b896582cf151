use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use meetup_sync::config;
use meetup_sync::credentials::{CredentialStore, OAuthSettings};
use meetup_sync::db;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Print the meetup.com authorize URL, or exchange a returned code and store the credential"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Authorization code from the redirect; omit to print the authorize URL
    #[arg(long)]
    code: Option<String>,

    /// Overrides `meetup.redirect_uri`
    #[arg(long)]
    redirect_uri: Option<String>,
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

    let redirect_uri = args
        .redirect_uri
        .or_else(|| cfg.meetup.redirect_uri.clone())
        .context("no redirect URI: pass --redirect-uri or set meetup.redirect_uri")?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = CredentialStore::new(pool, OAuthSettings::from_config(&cfg.meetup)?);

    match args.code {
        None => println!("{}", store.authorize_url(&redirect_uri)),
        Some(code) => {
            let cred = store
                .exchange_authorization_code(&code, &redirect_uri)
                .await
                .context("authorization code exchange failed")?;
            info!(expires_at = %cred.expires_at, "credential stored");
        }
    }
    Ok(())
}
