//! Configuration loader and validator for the meetup.com sync worker.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::client::DEFAULT_PAGE_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub meetup: Meetup,
    pub warehouse: Warehouse,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_inter_target_delay_ms")]
    pub inter_target_delay_ms: u64,
    #[serde(default = "default_run_interval_seconds")]
    pub run_interval_seconds: u64,
    /// Keys the job id digest; changing it changes every job id.
    pub secret_key: String,
}

/// meetup.com API and OAuth client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Meetup {
    pub api_base: String,
    pub token_url: String,
    pub authorize_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// Destination for uploaded batches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warehouse {
    /// Load jobs authorized by an OAuth client holding a long-lived
    /// refresh token; access tokens are minted on demand.
    Bigquery {
        project_id: String,
        dataset_id: String,
        client_id: String,
        client_secret: String,
        refresh_token: String,
        #[serde(default = "default_google_token_url")]
        token_url: String,
        #[serde(default = "default_bigquery_base")]
        api_base: String,
    },
    Blob {
        root: String,
    },
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_inter_target_delay_ms() -> u64 {
    1000
}

fn default_run_interval_seconds() -> u64 {
    3600
}

fn default_bigquery_base() -> String {
    "https://bigquery.googleapis.com/".to_string()
}

fn default_google_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` and a blob root if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if !self.app.data_dir.trim().is_empty() {
            fs::create_dir_all(&self.app.data_dir)?;
        }
        if let Warehouse::Blob { root } = &self.warehouse {
            fs::create_dir_all(root)?;
        }
        Ok(())
    }

    /// `DATABASE_URL` wins over the sqlite file under `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/meetup.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.page_size == 0 {
        return Err(ConfigError::Invalid("app.page_size must be > 0"));
    }
    if cfg.app.secret_key.trim().is_empty() {
        return Err(ConfigError::Invalid("app.secret_key must be non-empty"));
    }

    if Url::parse(&cfg.meetup.api_base).is_err() {
        return Err(ConfigError::Invalid("meetup.api_base must be a valid URL"));
    }
    if Url::parse(&cfg.meetup.token_url).is_err() {
        return Err(ConfigError::Invalid("meetup.token_url must be a valid URL"));
    }
    if Url::parse(&cfg.meetup.authorize_url).is_err() {
        return Err(ConfigError::Invalid("meetup.authorize_url must be a valid URL"));
    }
    if cfg.meetup.client_id.trim().is_empty() {
        return Err(ConfigError::Invalid("meetup.client_id must be non-empty"));
    }
    if cfg.meetup.client_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("meetup.client_secret must be non-empty"));
    }

    match &cfg.warehouse {
        Warehouse::Bigquery {
            project_id,
            dataset_id,
            refresh_token,
            token_url,
            api_base,
            ..
        } => {
            if project_id.trim().is_empty() {
                return Err(ConfigError::Invalid("warehouse.project_id must be non-empty"));
            }
            if dataset_id.trim().is_empty() {
                return Err(ConfigError::Invalid("warehouse.dataset_id must be non-empty"));
            }
            if refresh_token.trim().is_empty() {
                return Err(ConfigError::Invalid("warehouse.refresh_token must be non-empty"));
            }
            if Url::parse(token_url).is_err() {
                return Err(ConfigError::Invalid("warehouse.token_url must be a valid URL"));
            }
            if Url::parse(api_base).is_err() {
                return Err(ConfigError::Invalid("warehouse.api_base must be a valid URL"));
            }
        }
        Warehouse::Blob { root } => {
            if root.trim().is_empty() {
                return Err(ConfigError::Invalid("warehouse.root must be non-empty"));
            }
        }
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  page_size: 2000
  inter_target_delay_ms: 1000
  run_interval_seconds: 3600
  secret_key: "CHANGE_ME"

meetup:
  api_base: "https://api.meetup.com/"
  token_url: "https://secure.meetup.com/oauth2/access"
  authorize_url: "https://secure.meetup.com/oauth2/authorize"
  client_id: "YOUR_MEETUP_OAUTH_CLIENT_ID"
  client_secret: "YOUR_MEETUP_OAUTH_CLIENT_SECRET"
  redirect_uri: "http://localhost:8000/meetup/callback"

warehouse:
  kind: bigquery
  project_id: "YOUR_GCP_PROJECT"
  dataset_id: "meetup"
  client_id: "YOUR_GOOGLE_OAUTH_CLIENT_ID"
  client_secret: "YOUR_GOOGLE_OAUTH_CLIENT_SECRET"
  refresh_token: "YOUR_GOOGLE_REFRESH_TOKEN"
"#
}
