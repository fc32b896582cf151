use thiserror::Error;

/// Failures surfaced by the sync engine.
///
/// Only `UploadConflict` is recovered locally (see `upload::upload_records`);
/// everything else propagates to the per-target caller.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no API credentials stored; run the OAuth handshake first")]
    MissingCredentials,
    #[error("token refresh failed with status {status}: {body}")]
    UpstreamAuth { status: u16, body: String },
    #[error("token endpoint returned an unusable grant: {0}")]
    InvalidGrant(String),
    #[error("upstream request to {url} failed with status {status}")]
    UpstreamRequest { status: u16, url: String },
    #[error("job {job_id} was already submitted")]
    UploadConflict { job_id: String },
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

