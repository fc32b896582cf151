//! Filesystem object-store sink: gzip ND-JSON objects under a root directory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{Encoding, UploadBatch, WarehouseSink};
use crate::error::SyncError;

const JOB_MARKER_DIR: &str = "_jobs";

#[derive(Debug, Clone)]
pub struct BlobSink {
    root: PathBuf,
}

impl BlobSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<entity>/[group=<scope>/]date=<YYYY-MM-DD>/<name>_<YYYYMMDDHHMMSS>.json.gz`
    /// where `name` is the scope when present, the entity otherwise.
    pub fn object_key(entity: &str, scope: Option<&str>, created_at: DateTime<Utc>) -> String {
        let date = created_at.format("%Y-%m-%d");
        let stamp = created_at.format("%Y%m%d%H%M%S");
        match scope {
            Some(scope) => format!("{entity}/group={scope}/date={date}/{scope}_{stamp}.json.gz"),
            None => format!("{entity}/date={date}/{entity}_{stamp}.json.gz"),
        }
    }

    fn marker_path(&self, job_id: &str) -> PathBuf {
        self.root.join(JOB_MARKER_DIR).join(job_id)
    }
}

#[async_trait]
impl WarehouseSink for BlobSink {
    fn encoding(&self) -> Encoding {
        Encoding::Gzip
    }

    /// Claims the job marker first, then writes the object. A failed write
    /// releases the marker so the batch can be resubmitted.
    async fn upload(&self, batch: &UploadBatch<'_>) -> Result<(), SyncError> {
        let conflict = || SyncError::UploadConflict {
            job_id: batch.job_id.to_string(),
        };
        let marker = self.marker_path(batch.job_id);
        let key = Self::object_key(batch.entity, batch.scope, batch.created_at);
        let target = self.root.join(&key);

        if fs::try_exists(&target).await? {
            return Err(conflict());
        }
        if let Some(parent) = marker.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut claim = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(conflict()),
            Err(e) => return Err(e.into()),
        };

        let written = async {
            claim.write_all(key.as_bytes()).await?;
            claim.sync_all().await?;
            write_object(&target, &batch.payload).await
        }
        .await;
        if let Err(err) = written {
            warn!(?err, job_id = batch.job_id, "object write failed, releasing job marker");
            let _ = fs::remove_file(&marker).await;
            return Err(err.into());
        }

        debug!(key = %key, bytes = batch.payload.len(), "object written");
        Ok(())
    }
}

/// Temp file, fsync, then rename into place.
async fn write_object(target: &Path, payload: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp = target.with_extension("tmp");
    let mut file = fs::File::create(&temp).await?;
    file.write_all(payload).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp, target).await
}
