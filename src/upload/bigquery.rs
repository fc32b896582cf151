//! BigQuery load-job sink (REST `jobs.insert`, multipart media upload).

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Encoding, UploadBatch, WarehouseSink};
use crate::client::AccessTokenProvider;
use crate::error::SyncError;

#[derive(Clone)]
pub struct BigQuerySink {
    http: Client,
    api_base: Url,
    project_id: String,
    dataset_id: String,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl fmt::Debug for BigQuerySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQuerySink")
            .field("api_base", &self.api_base)
            .field("project_id", &self.project_id)
            .field("dataset_id", &self.dataset_id)
            .finish_non_exhaustive()
    }
}

impl BigQuerySink {
    /// Every upload asks `tokens` for a bearer token, so short-lived Google
    /// access tokens are renewed between batches.
    pub fn with_base_url(
        project_id: String,
        dataset_id: String,
        tokens: Arc<dyn AccessTokenProvider>,
        api_base: Url,
    ) -> Self {
        let http = Client::builder()
            .user_agent(concat!("meetup-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_base,
            project_id,
            dataset_id,
            tokens,
        }
    }

    fn jobs_url(&self) -> Result<Url, SyncError> {
        let mut url = self
            .api_base
            .join(&format!(
                "upload/bigquery/v2/projects/{}/jobs",
                self.project_id
            ))
            .map_err(|e| SyncError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut().append_pair("uploadType", "multipart");
        Ok(url)
    }

    /// Append-only load into the day partition of `batch.entity`, with a
    /// permissive schema: new fields and relaxed modes are accepted.
    pub fn load_job(&self, batch: &UploadBatch<'_>) -> Value {
        json!({
            "jobReference": {
                "projectId": self.project_id,
                "jobId": batch.job_id,
            },
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": self.project_id,
                        "datasetId": self.dataset_id,
                        "tableId": format!("{}${}", batch.entity, batch.created_at.format("%Y%m%d")),
                    },
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": "WRITE_APPEND",
                    "createDisposition": "CREATE_IF_NEEDED",
                    "autodetect": true,
                    "timePartitioning": { "type": "DAY" },
                    "schemaUpdateOptions": ["ALLOW_FIELD_ADDITION", "ALLOW_FIELD_RELAXATION"],
                }
            }
        })
    }
}

/// Body for `uploadType=multipart`: JSON metadata part, then the media part.
pub fn multipart_related(boundary: &str, metadata: &Value, media: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(media.len() + 512);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(media);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[derive(Deserialize)]
struct JobResponse {
    #[serde(default)]
    status: Option<JobStatus>,
}

#[derive(Deserialize)]
struct JobStatus {
    #[serde(default)]
    state: Option<String>,
    #[serde(rename = "errorResult", default)]
    error_result: Option<Value>,
}

#[async_trait]
impl WarehouseSink for BigQuerySink {
    fn encoding(&self) -> Encoding {
        Encoding::Plain
    }

    async fn upload(&self, batch: &UploadBatch<'_>) -> Result<(), SyncError> {
        let boundary = format!("meetup_sync_{}", uuid::Uuid::new_v4().simple());
        let body = multipart_related(&boundary, &self.load_job(batch), &batch.payload);
        let token = self.tokens.access_token().await?;

        let res = self
            .http
            .post(self.jobs_url()?)
            .bearer_auth(token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await?;

        let status = res.status();
        if status == StatusCode::CONFLICT {
            return Err(SyncError::UploadConflict {
                job_id: batch.job_id.to_string(),
            });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, job_id = batch.job_id, "BigQuery rejected load job");
            return Err(SyncError::Upload(format!("bigquery error {status}: {body}")));
        }

        let job: JobResponse = res.json().await?;
        if let Some(status) = job.status {
            if let Some(error) = status.error_result {
                return Err(SyncError::Upload(format!("bigquery job failed: {error}")));
            }
            debug!(job_id = batch.job_id, state = ?status.state, "load job accepted");
        }
        Ok(())
    }
}
