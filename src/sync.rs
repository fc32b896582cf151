//! Sync engine: ties the API client, the record store, the scheduler and the
//! warehouse sink into the category, group and member jobs.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use reqwest::Url;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::client::ApiClient;
use crate::config::Config;
use crate::credentials::{CredentialStore, OAuthSettings};
use crate::db::{self, Pool, SyncTarget};
use crate::error::SyncError;
use crate::records::{Category, GroupMember};
use crate::scheduler;
use crate::upload::{self, JobIdGenerator, UploadOutcome, WarehouseSink};

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Pause between two member targets.
    pub inter_target_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            inter_target_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupsReport {
    pub groups: usize,
    pub upload: UploadOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub members: usize,
    pub upload: UploadOutcome,
    pub next_update: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub urlname: String,
    pub error: String,
}

/// Per-target outcome of one member sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: Vec<String>,
    pub failed: Vec<TargetFailure>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct SyncEngine {
    pool: Pool,
    client: ApiClient,
    sink: Arc<dyn WarehouseSink>,
    job_ids: JobIdGenerator,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(
        pool: Pool,
        client: ApiClient,
        sink: Arc<dyn WarehouseSink>,
        job_ids: JobIdGenerator,
        settings: SyncSettings,
    ) -> Self {
        Self {
            pool,
            client,
            sink,
            job_ids,
            settings,
        }
    }

    /// Wire the credential store, API client and configured sink together.
    pub fn from_config(cfg: &Config, pool: Pool) -> Result<Self, SyncError> {
        let tokens = Arc::new(CredentialStore::new(
            pool.clone(),
            OAuthSettings::from_config(&cfg.meetup)?,
        ));
        let api_base = Url::parse(&cfg.meetup.api_base)
            .map_err(|e| SyncError::InvalidUrl(format!("{}: {e}", cfg.meetup.api_base)))?;
        let client = ApiClient::with_base_url(tokens, api_base).with_page_size(cfg.app.page_size);
        let sink = upload::sink_from_config(&cfg.warehouse)?;
        Ok(Self::new(
            pool,
            client,
            sink,
            JobIdGenerator::new(&cfg.app.secret_key),
            SyncSettings {
                inter_target_delay: Duration::from_millis(cfg.app.inter_target_delay_ms),
            },
        ))
    }

    /// Fetch every category and upsert them in one transaction.
    #[instrument(skip_all)]
    pub async fn sync_categories(&self) -> Result<usize, SyncError> {
        let categories: Vec<Category> = self.client.categories().try_collect().await?;
        let mut tx = self.pool.begin().await?;
        let mut stored = 0;
        for category in &categories {
            if db::upsert_category(&mut *tx, category).await? {
                stored += 1;
            }
        }
        tx.commit().await?;
        info!(stored, "categories synced");
        Ok(stored)
    }

    /// Discover groups through the active filters and upload them as one batch.
    #[instrument(skip_all)]
    pub async fn sync_groups(&self) -> Result<GroupsReport, SyncError> {
        let now = Utc::now();
        let groups = scheduler::discover_targets(&self.pool, &self.client).await?;
        let job_id = self
            .job_ids
            .deterministic_job_id(&format!("sync_groups_{}", now.format("%Y%m%d")));
        let upload = upload::upload_records(self.sink.as_ref(), "groups", None, &job_id, &groups).await?;
        Ok(GroupsReport {
            groups: groups.len(),
            upload,
        })
    }

    /// Fetch, store and upload one group's members, then schedule its next
    /// sync. Any failure leaves the schedule untouched so the group stays due.
    #[instrument(skip_all, fields(urlname = %target.urlname))]
    pub async fn sync_group_members(&self, target: &SyncTarget) -> Result<TargetReport, SyncError> {
        let now = Utc::now();
        let members: Vec<GroupMember> = self
            .client
            .group_members(&target.urlname)
            .try_collect()
            .await?;
        let stored = db::upsert_group_members(&self.pool, &target.urlname, &members).await?;

        let label = format!("sync_members_{}_{}", target.urlname, now.format("%Y%m%d"));
        let job_id = self.job_ids.deterministic_job_id(&label);
        let upload = upload::upload_records(
            self.sink.as_ref(),
            "members",
            Some(&target.urlname),
            &job_id,
            &members,
        )
        .await?;

        let next_update =
            scheduler::mark_synced(&self.pool, target, Utc::now(), &mut StdRng::from_entropy())
                .await?;
        Ok(TargetReport {
            members: stored,
            upload,
            next_update,
        })
    }

    /// Sync every due group one at a time. A failing target is recorded and
    /// skipped; a credential failure ends the run since no further request
    /// can be authorized.
    #[instrument(skip_all)]
    pub async fn sync_due_members(&self) -> Result<RunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let targets = scheduler::due_targets(&self.pool, started_at).await?;
        info!(%run_id, due = targets.len(), "member sync started");

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (i, target) in targets.iter().enumerate() {
            if i > 0 && !self.settings.inter_target_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_target_delay).await;
            }
            match self.sync_group_members(target).await {
                Ok(report) => {
                    info!(
                        urlname = %target.urlname,
                        members = report.members,
                        upload = ?report.upload,
                        next_update = %report.next_update,
                        "group synced"
                    );
                    succeeded.push(target.urlname.clone());
                }
                Err(err) => {
                    error!(urlname = %target.urlname, ?err, "group sync failed");
                    let fatal = matches!(
                        err,
                        SyncError::UpstreamAuth { .. }
                            | SyncError::InvalidGrant(_)
                            | SyncError::MissingCredentials
                    );
                    failed.push(TargetFailure {
                        urlname: target.urlname.clone(),
                        error: err.to_string(),
                    });
                    if fatal {
                        warn!(remaining = targets.len() - i - 1, "credentials unavailable, ending run");
                        break;
                    }
                }
            }
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            succeeded,
            failed,
        };
        info!(
            %run_id,
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            "member sync finished"
        );
        Ok(summary)
    }

    /// Group discovery followed by the member pass. A failed discovery is
    /// logged and the already known due groups are still synced.
    #[instrument(skip_all)]
    pub async fn run_all(&self) -> Result<RunSummary, SyncError> {
        match self.sync_groups().await {
            Ok(report) => info!(groups = report.groups, upload = ?report.upload, "groups synced"),
            Err(err) => error!(?err, "group discovery failed, continuing with due members"),
        }
        self.sync_due_members().await
    }
}
