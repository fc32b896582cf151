use super::model::{Credential, GroupFilter, SyncTarget};
use crate::records::{Category, Group, GroupMember};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::{debug, instrument};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask sqlx to create the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn load_credential(pool: &Pool) -> sqlx::Result<Option<Credential>> {
    sqlx::query_as::<_, Credential>(
        "SELECT access_token, refresh_token, expires_at FROM api_credentials WHERE id = 1",
    )
    .fetch_optional(pool)
    .await
}

/// Create or replace the singleton row.
#[instrument(skip_all)]
pub async fn upsert_credential(pool: &Pool, cred: &Credential) -> sqlx::Result<()> {
    sqlx::query(
        r#"INSERT INTO api_credentials (id, access_token, refresh_token, expires_at)
           VALUES (1, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
             access_token = excluded.access_token,
             refresh_token = excluded.refresh_token,
             expires_at = excluded.expires_at,
             updated_at = CURRENT_TIMESTAMP"#,
    )
    .bind(&cred.access_token)
    .bind(&cred.refresh_token)
    .bind(cred.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Replace the credential only if it still holds `expected_refresh_token`.
/// Returns false when another writer refreshed first.
#[instrument(skip_all)]
pub async fn swap_credential(
    pool: &Pool,
    expected_refresh_token: &str,
    cred: &Credential,
) -> sqlx::Result<bool> {
    let res = sqlx::query(
        r#"UPDATE api_credentials
           SET access_token = ?, refresh_token = ?, expires_at = ?, updated_at = CURRENT_TIMESTAMP
           WHERE id = 1 AND refresh_token = ?"#,
    )
    .bind(&cred.access_token)
    .bind(&cred.refresh_token)
    .bind(cred.expires_at)
    .bind(expected_refresh_token)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Categories, locations, filters
// ---------------------------------------------------------------------------

/// Returns false when the category carries no id.
#[instrument(skip_all)]
pub async fn upsert_category<'e, E>(executor: E, category: &Category) -> sqlx::Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let Some(id) = category.id else {
        debug!("category without id, skipping");
        return Ok(false);
    };
    sqlx::query(
        r#"INSERT INTO meetup_categories (id, shortname, name) VALUES (?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
             shortname = COALESCE(excluded.shortname, shortname),
             name = COALESCE(excluded.name, name)"#,
    )
    .bind(id)
    .bind(&category.shortname)
    .bind(&category.name)
    .execute(executor)
    .await?;
    Ok(true)
}

#[instrument(skip_all)]
pub async fn get_or_create_location(pool: &Pool, country: &str, location: &str) -> sqlx::Result<i64> {
    if let Some(id) = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM meetup_locations WHERE country = ? AND location = ?",
    )
    .bind(country)
    .bind(location)
    .fetch_optional(pool)
    .await?
    {
        return Ok(id);
    }

    sqlx::query_scalar::<_, i64>(
        "INSERT INTO meetup_locations (country, location) VALUES (?, ?) RETURNING id",
    )
    .bind(country)
    .bind(location)
    .fetch_one(pool)
    .await
}

/// Insert a filter, or re-activate the existing one for the same pair.
#[instrument(skip_all)]
pub async fn insert_filter(pool: &Pool, category_id: i64, location_id: i64) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        r#"INSERT INTO meetup_group_filters (category_id, location_id, active) VALUES (?, ?, 1)
           ON CONFLICT(category_id, location_id) DO UPDATE SET active = 1
           RETURNING id"#,
    )
    .bind(category_id)
    .bind(location_id)
    .fetch_one(pool)
    .await
}

#[instrument(skip_all)]
pub async fn set_filter_active(pool: &Pool, filter_id: i64, active: bool) -> sqlx::Result<bool> {
    let res = sqlx::query("UPDATE meetup_group_filters SET active = ? WHERE id = ?")
        .bind(active)
        .bind(filter_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

const FILTER_SELECT: &str = r#"
    SELECT f.id, f.category_id, c.name AS category_name, l.country, l.location, f.active
    FROM meetup_group_filters f
    JOIN meetup_locations l ON l.id = f.location_id
    LEFT JOIN meetup_categories c ON c.id = f.category_id"#;

#[instrument(skip_all)]
pub async fn list_filters(pool: &Pool) -> sqlx::Result<Vec<GroupFilter>> {
    sqlx::query_as::<_, GroupFilter>(&format!("{FILTER_SELECT} ORDER BY f.id"))
        .fetch_all(pool)
        .await
}

#[instrument(skip_all)]
pub async fn active_filters(pool: &Pool) -> sqlx::Result<Vec<GroupFilter>> {
    sqlx::query_as::<_, GroupFilter>(&format!("{FILTER_SELECT} WHERE f.active = 1 ORDER BY f.id"))
        .fetch_all(pool)
        .await
}

// ---------------------------------------------------------------------------
// Groups (sync targets)
// ---------------------------------------------------------------------------

/// Upsert by `urlname`. A new row starts with `initial_next_update`; an
/// existing row keeps its schedule, and fields absent upstream keep their
/// stored values. Returns false when the group carries no urlname.
#[instrument(skip_all)]
pub async fn upsert_group<'e, E>(
    executor: E,
    group: &Group,
    initial_next_update: DateTime<Utc>,
) -> sqlx::Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let Some(urlname) = group.urlname.as_deref() else {
        debug!(id = ?group.id, "group without urlname, skipping");
        return Ok(false);
    };
    sqlx::query(
        r#"INSERT INTO meetup_groups (
             urlname, id, name, status, description, created, city, untranslated_city,
             country, state, join_mode, visibility, lat, lon, members, who,
             organizer_id, organizer_name, timezone, next_event_id, next_event_name,
             next_event_yes_rsvp_count, next_event_time, category_id, category_shortname,
             meta_category_id, meta_category_shortname, members_next_update)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(urlname) DO UPDATE SET
             id = COALESCE(excluded.id, id),
             name = COALESCE(excluded.name, name),
             status = COALESCE(excluded.status, status),
             description = COALESCE(excluded.description, description),
             created = COALESCE(excluded.created, created),
             city = COALESCE(excluded.city, city),
             untranslated_city = COALESCE(excluded.untranslated_city, untranslated_city),
             country = COALESCE(excluded.country, country),
             state = COALESCE(excluded.state, state),
             join_mode = COALESCE(excluded.join_mode, join_mode),
             visibility = COALESCE(excluded.visibility, visibility),
             lat = COALESCE(excluded.lat, lat),
             lon = COALESCE(excluded.lon, lon),
             members = COALESCE(excluded.members, members),
             who = COALESCE(excluded.who, who),
             organizer_id = COALESCE(excluded.organizer_id, organizer_id),
             organizer_name = COALESCE(excluded.organizer_name, organizer_name),
             timezone = COALESCE(excluded.timezone, timezone),
             next_event_id = excluded.next_event_id,
             next_event_name = excluded.next_event_name,
             next_event_yes_rsvp_count = excluded.next_event_yes_rsvp_count,
             next_event_time = excluded.next_event_time,
             category_id = COALESCE(excluded.category_id, category_id),
             category_shortname = COALESCE(excluded.category_shortname, category_shortname),
             meta_category_id = COALESCE(excluded.meta_category_id, meta_category_id),
             meta_category_shortname = COALESCE(excluded.meta_category_shortname, meta_category_shortname),
             updated_at = CURRENT_TIMESTAMP"#,
    )
    .bind(urlname)
    .bind(group.id)
    .bind(&group.name)
    .bind(&group.status)
    .bind(&group.description)
    .bind(group.created)
    .bind(&group.city)
    .bind(&group.untranslated_city)
    .bind(&group.country)
    .bind(&group.state)
    .bind(&group.join_mode)
    .bind(&group.visibility)
    .bind(group.lat)
    .bind(group.lon)
    .bind(group.members)
    .bind(&group.who)
    .bind(group.organizer_id)
    .bind(&group.organizer_name)
    .bind(&group.timezone)
    .bind(&group.next_event_id)
    .bind(&group.next_event_name)
    .bind(group.next_event_yes_rsvp_count)
    .bind(group.next_event_time)
    .bind(group.category_id)
    .bind(&group.category_shortname)
    .bind(group.meta_category_id)
    .bind(&group.meta_category_shortname)
    .bind(initial_next_update)
    .execute(executor)
    .await?;
    Ok(true)
}

/// Public groups whose member sync is due at `now`, oldest schedule first.
#[instrument(skip_all)]
pub async fn groups_due_for_members(pool: &Pool, now: DateTime<Utc>) -> sqlx::Result<Vec<SyncTarget>> {
    sqlx::query_as::<_, SyncTarget>(
        r#"SELECT urlname, name, members_next_update AS next_update
           FROM meetup_groups
           WHERE members_next_update <= ? AND visibility = 'public'
           ORDER BY members_next_update, urlname"#,
    )
    .bind(now)
    .fetch_all(pool)
    .await
}

#[instrument(skip_all)]
pub async fn get_sync_target(pool: &Pool, urlname: &str) -> sqlx::Result<Option<SyncTarget>> {
    sqlx::query_as::<_, SyncTarget>(
        "SELECT urlname, name, members_next_update AS next_update FROM meetup_groups WHERE urlname = ?",
    )
    .bind(urlname)
    .fetch_optional(pool)
    .await
}

#[instrument(skip_all)]
pub async fn set_members_next_update(
    pool: &Pool,
    urlname: &str,
    next_update: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let res = sqlx::query("UPDATE meetup_groups SET members_next_update = ? WHERE urlname = ?")
        .bind(next_update)
        .bind(urlname)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Users and memberships
// ---------------------------------------------------------------------------

/// Upsert every member's user row and group membership in one transaction.
/// Members without an id are skipped. Returns the number stored.
#[instrument(skip_all, fields(urlname = %urlname, members = members.len()))]
pub async fn upsert_group_members(
    pool: &Pool,
    urlname: &str,
    members: &[GroupMember],
) -> sqlx::Result<usize> {
    let mut tx = pool.begin().await?;
    let mut stored = 0;
    for member in members {
        let Some(user_id) = member.id else {
            debug!("member without id, skipping");
            continue;
        };
        sqlx::query(
            r#"INSERT INTO meetup_users (
                 id, name, status, joined, city, country, lat, lon, is_pro_admin,
                 messaging_pref, privacy_bio, privacy_groups, privacy_topics)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = COALESCE(excluded.name, name),
                 status = COALESCE(excluded.status, status),
                 joined = COALESCE(excluded.joined, joined),
                 city = COALESCE(excluded.city, city),
                 country = COALESCE(excluded.country, country),
                 lat = COALESCE(excluded.lat, lat),
                 lon = COALESCE(excluded.lon, lon),
                 is_pro_admin = excluded.is_pro_admin,
                 messaging_pref = COALESCE(excluded.messaging_pref, messaging_pref),
                 privacy_bio = COALESCE(excluded.privacy_bio, privacy_bio),
                 privacy_groups = COALESCE(excluded.privacy_groups, privacy_groups),
                 privacy_topics = COALESCE(excluded.privacy_topics, privacy_topics)"#,
        )
        .bind(user_id)
        .bind(&member.name)
        .bind(&member.status)
        .bind(member.joined)
        .bind(&member.city)
        .bind(&member.country)
        .bind(member.lat)
        .bind(member.lon)
        .bind(member.is_pro_admin.unwrap_or(false))
        .bind(&member.messaging_pref)
        .bind(&member.privacy_bio)
        .bind(&member.privacy_groups)
        .bind(&member.privacy_topics)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO meetup_group_members (
                 user_id, group_urlname, status, visited, created, updated, role)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(user_id, group_urlname) DO UPDATE SET
                 status = COALESCE(excluded.status, status),
                 visited = COALESCE(excluded.visited, visited),
                 created = COALESCE(excluded.created, created),
                 updated = COALESCE(excluded.updated, updated),
                 role = excluded.role"#,
        )
        .bind(user_id)
        .bind(urlname)
        .bind(&member.group_status)
        .bind(member.group_visited)
        .bind(member.group_created)
        .bind(member.group_updated)
        .bind(&member.group_role)
        .execute(&mut *tx)
        .await?;
        stored += 1;
    }
    tx.commit().await?;
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ApiRecord;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sentinel() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
    }

    fn group(urlname: &str, visibility: &str) -> Group {
        Group::from_json(&json!({
            "id": 1,
            "urlname": urlname,
            "name": format!("{urlname} group"),
            "visibility": visibility,
            "members": 10,
        }))
    }

    #[tokio::test]
    async fn credential_swap_requires_matching_refresh_token() {
        let pool = setup_pool().await;
        assert!(load_credential(&pool).await.unwrap().is_none());

        let first = Credential {
            access_token: "a1".into(),
            refresh_token: "r1".into(),
            expires_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };
        upsert_credential(&pool, &first).await.unwrap();

        let second = Credential {
            access_token: "a2".into(),
            refresh_token: "r2".into(),
            ..first.clone()
        };
        assert!(!swap_credential(&pool, "stale", &second).await.unwrap());
        assert_eq!(load_credential(&pool).await.unwrap(), Some(first));

        assert!(swap_credential(&pool, "r1", &second).await.unwrap());
        assert_eq!(load_credential(&pool).await.unwrap(), Some(second));
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM api_credentials")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn group_upsert_keeps_schedule_and_known_fields() {
        let pool = setup_pool().await;
        assert!(upsert_group(&pool, &group("pyporto", "public"), sentinel()).await.unwrap());

        let target = get_sync_target(&pool, "pyporto").await.unwrap().unwrap();
        assert_eq!(target.next_update, sentinel());

        let tomorrow = Utc::now() + Duration::days(1);
        set_members_next_update(&pool, "pyporto", tomorrow).await.unwrap();

        let mut refreshed = group("pyporto", "public");
        refreshed.members = None;
        refreshed.name = Some("Python Porto".into());
        upsert_group(&pool, &refreshed, sentinel()).await.unwrap();

        let target = get_sync_target(&pool, "pyporto").await.unwrap().unwrap();
        assert_eq!(target.next_update, tomorrow);
        assert_eq!(target.name.as_deref(), Some("Python Porto"));
        let members: Option<i64> =
            sqlx::query_scalar("SELECT members FROM meetup_groups WHERE urlname = 'pyporto'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(members, Some(10));

        let mut anonymous = group("x", "public");
        anonymous.urlname = None;
        assert!(!upsert_group(&pool, &anonymous, sentinel()).await.unwrap());
    }

    #[tokio::test]
    async fn only_public_due_groups_are_selected() {
        let pool = setup_pool().await;
        for (name, visibility) in [("a", "public"), ("b", "members"), ("c", "public")] {
            upsert_group(&pool, &group(name, visibility), sentinel())
                .await
                .unwrap();
        }
        let now = Utc::now();
        set_members_next_update(&pool, "c", now + Duration::hours(3))
            .await
            .unwrap();

        let due = groups_due_for_members(&pool, now).await.unwrap();
        let names: Vec<_> = due.iter().map(|t| t.urlname.as_str()).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[tokio::test]
    async fn filters_join_location_and_category() {
        let pool = setup_pool().await;
        let tech = Category::from_json(&json!({ "id": 34, "shortname": "tech", "name": "Tech" }));
        upsert_category(&pool, &tech).await.unwrap();

        let loc = get_or_create_location(&pool, "pt", "Porto").await.unwrap();
        assert_eq!(get_or_create_location(&pool, "pt", "Porto").await.unwrap(), loc);
        let id = insert_filter(&pool, 34, loc).await.unwrap();
        assert_eq!(insert_filter(&pool, 34, loc).await.unwrap(), id);

        let active = active_filters(&pool).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].category_name.as_deref(), Some("Tech"));
        assert_eq!(active[0].location, "Porto");

        assert!(set_filter_active(&pool, id, false).await.unwrap());
        assert!(active_filters(&pool).await.unwrap().is_empty());
        assert_eq!(list_filters(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn members_upsert_users_and_memberships() {
        let pool = setup_pool().await;
        upsert_group(&pool, &group("pyporto", "public"), sentinel())
            .await
            .unwrap();
        let members = vec![
            GroupMember::from_json(&json!({
                "id": 5,
                "name": "Bruno",
                "group_profile": { "status": "active", "role": "organizer" }
            })),
            GroupMember::from_json(&json!({ "name": "no id" })),
        ];

        assert_eq!(upsert_group_members(&pool, "pyporto", &members).await.unwrap(), 1);
        assert_eq!(upsert_group_members(&pool, "pyporto", &members).await.unwrap(), 1);

        let (users, memberships): (i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM meetup_users), (SELECT COUNT(*) FROM meetup_group_members)",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!((users, memberships), (1, 1));
    }

    #[test]
    fn file_urls_request_create_mode() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("sqlite:///tmp/meetup-sync-test/db.sqlite"),
            "sqlite:///tmp/meetup-sync-test/db.sqlite?mode=rwc"
        );
        assert_eq!(
            prepare_sqlite_url("sqlite:///tmp/meetup-sync-test/x.db?mode=ro"),
            "sqlite:///tmp/meetup-sync-test/x.db?mode=ro"
        );
    }
}
