//! Upload pipeline: newline-delimited JSON batches shipped to the warehouse
//! under deterministic, dedup-safe job ids.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha1::Sha1;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::Warehouse;
use crate::credentials::RefreshingToken;
use crate::error::SyncError;

pub mod bigquery;
pub mod blob;

pub use bigquery::BigQuerySink;
pub use blob::BlobSink;

type HmacSha1 = Hmac<Sha1>;

/// Upper bound for a job id, digest included.
pub const JOB_ID_MAX_LEN: usize = 84;
const DIGEST_HEX_LEN: usize = 40;
const LABEL_MAX_LEN: usize = JOB_ID_MAX_LEN - DIGEST_HEX_LEN - 1;

/// Renders instants as `YYYY-MM-DDTHH:MM:SSZ`.
pub mod timestamp_format {
    use chrono::{DateTime, Utc};
    use serde::Serializer;

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.collect_str(&ts.format(FORMAT)),
            None => serializer.serialize_none(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Plain,
    Gzip,
}

/// One serialized batch handed to a sink.
#[derive(Debug, Clone)]
pub struct UploadBatch<'a> {
    /// Table or top-level prefix, e.g. `groups` or `members`.
    pub entity: &'a str,
    /// Optional sub-partition, e.g. the group urlname for member batches.
    pub scope: Option<&'a str>,
    pub job_id: &'a str,
    pub created_at: DateTime<Utc>,
    pub record_count: usize,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait WarehouseSink: Send + Sync {
    fn encoding(&self) -> Encoding;

    /// Must return `SyncError::UploadConflict` when `batch.job_id` was already accepted.
    async fn upload(&self, batch: &UploadBatch<'_>) -> Result<(), SyncError>;
}

/// Build the sink selected by the `warehouse` config section.
pub fn sink_from_config(cfg: &Warehouse) -> Result<Arc<dyn WarehouseSink>, SyncError> {
    let sink: Arc<dyn WarehouseSink> = match cfg {
        Warehouse::Bigquery {
            project_id,
            dataset_id,
            client_id,
            client_secret,
            refresh_token,
            token_url,
            api_base,
        } => {
            let parse = |raw: &str| {
                reqwest::Url::parse(raw).map_err(|e| SyncError::InvalidUrl(format!("{raw}: {e}")))
            };
            let tokens = RefreshingToken::new(
                parse(token_url)?,
                client_id.clone(),
                client_secret.clone(),
                refresh_token.clone(),
            );
            Arc::new(BigQuerySink::with_base_url(
                project_id.clone(),
                dataset_id.clone(),
                Arc::new(tokens),
                parse(api_base)?,
            ))
        }
        Warehouse::Blob { root } => Arc::new(BlobSink::new(root)),
    };
    Ok(sink)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    AlreadySubmitted,
}

/// Serialize one record as compact JSON with sorted keys. If any field
/// cannot be represented as JSON the whole record degrades to a single JSON
/// string holding its `Debug` rendering.
pub fn encode_line<T: Serialize + fmt::Debug>(record: &T) -> String {
    let value = serde_json::to_value(record).unwrap_or_else(|err| {
        debug!(?err, "record is not representable as JSON, using debug form");
        Value::String(format!("{record:?}"))
    });
    value.to_string()
}

pub fn serialize_records<T: Serialize + fmt::Debug>(
    records: &[T],
    encoding: Encoding,
) -> Result<Vec<u8>, SyncError> {
    let mut ndjson = Vec::new();
    for record in records {
        ndjson.extend_from_slice(encode_line(record).as_bytes());
        ndjson.push(b'\n');
    }
    match encoding {
        Encoding::Plain => Ok(ndjson),
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&ndjson)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Derives job ids that are stable for a label and distinct across labels.
#[derive(Clone)]
pub struct JobIdGenerator {
    secret: Vec<u8>,
}

impl fmt::Debug for JobIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobIdGenerator").finish_non_exhaustive()
    }
}

impl JobIdGenerator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// `<sanitized label>_<hex HMAC-SHA1(label)>`, at most [`JOB_ID_MAX_LEN`] chars.
    pub fn deterministic_job_id(&self, label: &str) -> String {
        let sanitized: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .take(LABEL_MAX_LEN)
            .collect();
        let mut mac =
            HmacSha1::new_from_slice(&self.secret).expect("HMAC accepts keys of any length");
        mac.update(label.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        format!("{sanitized}_{digest}")
    }
}

/// Serialize `records` for `sink` and submit them. A duplicate job id means
/// the batch was already ingested and is reported as `AlreadySubmitted`.
#[instrument(skip_all, fields(entity = %entity, job_id = %job_id))]
pub async fn upload_records<T: Serialize + fmt::Debug + Sync>(
    sink: &dyn WarehouseSink,
    entity: &str,
    scope: Option<&str>,
    job_id: &str,
    records: &[T],
) -> Result<UploadOutcome, SyncError> {
    let batch = UploadBatch {
        entity,
        scope,
        job_id,
        created_at: Utc::now(),
        record_count: records.len(),
        payload: serialize_records(records, sink.encoding())?,
    };

    match sink.upload(&batch).await {
        Ok(()) => {
            info!(records = batch.record_count, "batch uploaded");
            Ok(UploadOutcome::Uploaded)
        }
        Err(SyncError::UploadConflict { job_id }) => {
            warn!(%job_id, "batch already submitted, skipping");
            Ok(UploadOutcome::AlreadySubmitted)
        }
        Err(err) => Err(err),
    }
}
