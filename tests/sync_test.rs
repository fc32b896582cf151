use async_trait::async_trait;
use meetup_sync::client::{AccessTokenProvider, ApiClient, StaticToken};
use meetup_sync::db;
use meetup_sync::mapper::ApiRecord;
use meetup_sync::records::{Category, Group};
use meetup_sync::scheduler::first_sync_sentinel;
use meetup_sync::sync::{SyncEngine, SyncSettings};
use meetup_sync::upload::{Encoding, JobIdGenerator, UploadBatch, UploadOutcome, WarehouseSink};
use meetup_sync::SyncError;
use reqwest::Url;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn setup_pool() -> db::Pool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Debug, Clone)]
struct RecordedBatch {
    entity: String,
    scope: Option<String>,
    job_id: String,
    record_count: usize,
    payload: Vec<u8>,
}

#[derive(Clone, Default)]
struct RecordingSink {
    responses: Arc<Mutex<VecDeque<Result<(), SyncError>>>>,
    batches: Arc<Mutex<Vec<RecordedBatch>>>,
}

impl RecordingSink {
    fn with_responses(responses: Vec<Result<(), SyncError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn batches(&self) -> Vec<RecordedBatch> {
        self.batches.lock().await.clone()
    }
}

#[async_trait]
impl WarehouseSink for RecordingSink {
    fn encoding(&self) -> Encoding {
        Encoding::Plain
    }

    async fn upload(&self, batch: &UploadBatch<'_>) -> Result<(), SyncError> {
        self.batches.lock().await.push(RecordedBatch {
            entity: batch.entity.to_string(),
            scope: batch.scope.map(str::to_string),
            job_id: batch.job_id.to_string(),
            record_count: batch.record_count,
            payload: batch.payload.clone(),
        });
        self.responses.lock().await.pop_front().unwrap_or(Ok(()))
    }
}

struct RevokedToken;

#[async_trait]
impl AccessTokenProvider for RevokedToken {
    async fn access_token(&self) -> Result<String, SyncError> {
        Err(SyncError::UpstreamAuth {
            status: 401,
            body: "invalid_grant".into(),
        })
    }
}

fn engine_with(
    pool: &db::Pool,
    server: &MockServer,
    sink: &RecordingSink,
    tokens: Arc<dyn AccessTokenProvider>,
) -> SyncEngine {
    let client = ApiClient::with_base_url(tokens, Url::parse(&format!("{}/", server.uri())).unwrap())
        .with_page_size(200);
    SyncEngine::new(
        pool.clone(),
        client,
        Arc::new(sink.clone()),
        JobIdGenerator::new("secret"),
        SyncSettings {
            inter_target_delay: Duration::ZERO,
        },
    )
}

fn engine(pool: &db::Pool, server: &MockServer, sink: &RecordingSink) -> SyncEngine {
    engine_with(pool, server, sink, Arc::new(StaticToken("tok".into())))
}

async fn seed_group(pool: &db::Pool, urlname: &str) {
    let group = Group::from_json(&json!({
        "id": 1,
        "urlname": urlname,
        "name": urlname,
        "visibility": "public",
    }));
    db::upsert_group(pool, &group, first_sync_sentinel())
        .await
        .unwrap();
}

async fn mount_members(server: &MockServer, urlname: &str, status: u16) {
    let response = if status == 200 {
        ResponseTemplate::new(200).set_body_json(json!([
            { "id": 10, "name": "Ana", "group_profile": { "status": "active", "role": "organizer" } },
            { "id": 11, "name": "Rui", "is_pro_admin": true }
        ]))
    } else {
        ResponseTemplate::new(status)
    };
    Mock::given(method("GET"))
        .and(path(format!("/{urlname}/members")))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn next_update(pool: &db::Pool, urlname: &str) -> chrono::DateTime<chrono::Utc> {
    db::get_sync_target(pool, urlname)
        .await
        .unwrap()
        .unwrap()
        .next_update
}

#[tokio::test]
async fn groups_found_by_several_filters_are_stored_once() {
    let pool = setup_pool().await;
    let server = MockServer::start().await;
    let sink = RecordingSink::default();

    let tech = Category::from_json(&json!({ "id": 34, "shortname": "tech", "name": "Tech" }));
    db::upsert_category(&pool, &tech).await.unwrap();
    for city in ["Porto", "Lisbon"] {
        let loc = db::get_or_create_location(&pool, "pt", city).await.unwrap();
        db::insert_filter(&pool, 34, loc).await.unwrap();
    }

    Mock::given(method("GET"))
        .and(path("/find/groups"))
        .and(query_param("location", "Porto"))
        .and(query_param("category", "34"))
        .and(query_param("page", "200"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "urlname": "pyporto", "name": "Python Porto", "visibility": "public" }
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/find/groups"))
        .and(query_param("location", "Lisbon"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "urlname": "pyporto", "name": "Python Porto", "visibility": "public" },
            { "urlname": "pylisbon", "name": "Python Lisbon", "visibility": "public" }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let report = engine(&pool, &server, &sink).sync_groups().await.unwrap();
    assert_eq!(report.groups, 2);
    assert_eq!(report.upload, UploadOutcome::Uploaded);

    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM meetup_groups")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(stored, 2);
    assert_eq!(next_update(&pool, "pylisbon").await, first_sync_sentinel());

    let batches = sink.batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].entity, "groups");
    assert_eq!(batches[0].scope, None);
    assert_eq!(batches[0].record_count, 2);
    assert!(batches[0].job_id.starts_with("sync_groups_"));
}

#[tokio::test]
async fn member_sync_uploads_and_schedules_next_day() {
    let pool = setup_pool().await;
    let server = MockServer::start().await;
    let sink = RecordingSink::default();
    seed_group(&pool, "pyporto").await;
    mount_members(&server, "pyporto", 200).await;

    let started = chrono::Utc::now();
    let summary = engine(&pool, &server, &sink).sync_due_members().await.unwrap();
    assert_eq!(summary.succeeded, vec!["pyporto".to_string()]);
    assert!(summary.is_clean());

    let next = next_update(&pool, "pyporto").await;
    assert!(next > started + chrono::Duration::hours(1));
    assert!(next < started + chrono::Duration::hours(48));
    assert!(db::groups_due_for_members(&pool, chrono::Utc::now())
        .await
        .unwrap()
        .is_empty());

    let batches = sink.batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].entity, "members");
    assert_eq!(batches[0].scope.as_deref(), Some("pyporto"));
    assert!(batches[0].job_id.starts_with("sync_members_pyporto_"));
    let payload = String::from_utf8(batches[0].payload.clone()).unwrap();
    assert_eq!(payload.lines().count(), 2);
    assert!(payload.contains(r#""is_pro_admin":false"#));

    let memberships: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM meetup_group_members WHERE group_urlname = 'pyporto'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(memberships, 2);
}

#[tokio::test]
async fn already_submitted_batch_still_counts_as_synced() {
    let pool = setup_pool().await;
    let server = MockServer::start().await;
    let sink = RecordingSink::with_responses(vec![Err(SyncError::UploadConflict {
        job_id: "dup".into(),
    })]);
    seed_group(&pool, "pyporto").await;
    mount_members(&server, "pyporto", 200).await;

    let summary = engine(&pool, &server, &sink).sync_due_members().await.unwrap();
    assert_eq!(summary.succeeded, vec!["pyporto".to_string()]);
    assert!(next_update(&pool, "pyporto").await > chrono::Utc::now());
}

#[tokio::test]
async fn failed_upload_keeps_rows_but_leaves_group_due() {
    let pool = setup_pool().await;
    let server = MockServer::start().await;
    let sink = RecordingSink::with_responses(vec![Err(SyncError::Upload("quota exceeded".into()))]);
    seed_group(&pool, "pyporto").await;
    mount_members(&server, "pyporto", 200).await;

    let summary = engine(&pool, &server, &sink).sync_due_members().await.unwrap();
    assert!(summary.succeeded.is_empty());
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].error.contains("quota exceeded"));

    assert_eq!(next_update(&pool, "pyporto").await, first_sync_sentinel());
    let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM meetup_users")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(users, 2);
}

#[tokio::test]
async fn one_failing_group_does_not_stop_the_run() {
    let pool = setup_pool().await;
    let server = MockServer::start().await;
    let sink = RecordingSink::default();
    seed_group(&pool, "a-group").await;
    seed_group(&pool, "b-group").await;
    mount_members(&server, "a-group", 500).await;
    mount_members(&server, "b-group", 200).await;

    let summary = engine(&pool, &server, &sink).sync_due_members().await.unwrap();
    assert_eq!(summary.succeeded, vec!["b-group".to_string()]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].urlname, "a-group");
    assert!(summary.failed[0].error.contains("500"));

    assert_eq!(next_update(&pool, "a-group").await, first_sync_sentinel());
    assert!(next_update(&pool, "b-group").await > chrono::Utc::now());
    assert_eq!(sink.batches().await.len(), 1);

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["failed"][0]["urlname"], "a-group");
}

#[tokio::test]
async fn credential_failure_ends_the_run() {
    let pool = setup_pool().await;
    let server = MockServer::start().await;
    let sink = RecordingSink::default();
    seed_group(&pool, "a-group").await;
    seed_group(&pool, "b-group").await;
    mount_members(&server, "a-group", 200).await;
    mount_members(&server, "b-group", 200).await;

    let summary = engine_with(&pool, &server, &sink, Arc::new(RevokedToken))
        .sync_due_members()
        .await
        .unwrap();
    assert!(summary.succeeded.is_empty());
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].urlname, "a-group");
    assert!(sink.batches().await.is_empty());
}

#[tokio::test]
async fn same_day_rerun_reuses_job_id() {
    let pool = setup_pool().await;
    let server = MockServer::start().await;
    let sink = RecordingSink::default();
    seed_group(&pool, "pyporto").await;
    mount_members(&server, "pyporto", 200).await;

    let engine = engine(&pool, &server, &sink);
    let target = db::get_sync_target(&pool, "pyporto").await.unwrap().unwrap();
    engine.sync_group_members(&target).await.unwrap();
    engine.sync_group_members(&target).await.unwrap();

    let batches = sink.batches().await;
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].job_id, batches[1].job_id);
}

#[tokio::test]
async fn failed_group_discovery_still_syncs_due_members() {
    let pool = setup_pool().await;
    let server = MockServer::start().await;
    let sink = RecordingSink::default();

    let tech = Category::from_json(&json!({ "id": 34, "shortname": "tech", "name": "Tech" }));
    db::upsert_category(&pool, &tech).await.unwrap();
    let loc = db::get_or_create_location(&pool, "pt", "Porto").await.unwrap();
    db::insert_filter(&pool, 34, loc).await.unwrap();
    Mock::given(method("GET"))
        .and(path("/find/groups"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    seed_group(&pool, "pyporto").await;
    mount_members(&server, "pyporto", 200).await;

    let summary = engine(&pool, &server, &sink).run_all().await.unwrap();
    assert_eq!(summary.succeeded, vec!["pyporto".to_string()]);
    assert!(next_update(&pool, "pyporto").await > chrono::Utc::now());

    let batches = sink.batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].entity, "members");
}
