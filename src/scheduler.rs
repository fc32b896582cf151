//! Decides which groups are due for a member sync and spreads their next
//! refresh across the following day.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use futures::TryStreamExt;
use rand::Rng;
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::{info, instrument};

use crate::client::ApiClient;
use crate::db::{self, Pool, SyncTarget};
use crate::error::SyncError;
use crate::records::Group;

/// Minutes past the next UTC midnight from which a refresh time is drawn.
pub const JITTER_MINUTES: Range<i64> = 60..1380;

/// Schedule value of a newly discovered group: far enough in the past to be
/// due on the first pass.
pub fn first_sync_sentinel() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Tomorrow (UTC) at a uniformly random minute in [`JITTER_MINUTES`].
pub fn next_update_after<R: Rng + ?Sized>(now: DateTime<Utc>, rng: &mut R) -> DateTime<Utc> {
    let tomorrow = (now + Duration::days(1)).date_naive();
    let midnight = Utc.from_utc_datetime(&tomorrow.and_time(NaiveTime::default()));
    midnight + Duration::minutes(rng.gen_range(JITTER_MINUTES))
}

#[instrument(skip_all)]
pub async fn due_targets(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<SyncTarget>, SyncError> {
    Ok(db::groups_due_for_members(pool, now).await?)
}

/// Advance `target` to its next jittered refresh time and return it.
#[instrument(skip_all, fields(urlname = %target.urlname))]
pub async fn mark_synced<R: Rng + ?Sized>(
    pool: &Pool,
    target: &SyncTarget,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Result<DateTime<Utc>, SyncError> {
    let next = next_update_after(now, rng);
    db::set_members_next_update(pool, &target.urlname, next).await?;
    info!(next_update = %next, "next member sync scheduled");
    Ok(next)
}

/// Run every active filter against `find/groups`, keep one group per
/// urlname and upsert them. New groups start at [`first_sync_sentinel`].
#[instrument(skip_all)]
pub async fn discover_targets(pool: &Pool, client: &ApiClient) -> Result<Vec<Group>, SyncError> {
    let filters = db::active_filters(pool).await?;
    let mut by_urlname: BTreeMap<String, Group> = BTreeMap::new();

    for filter in &filters {
        let groups: Vec<Group> = client
            .find_groups(filter.category_id, &filter.country, &filter.location)
            .try_collect()
            .await?;
        info!(filter = %filter, found = groups.len(), "filter searched");
        for group in groups {
            if let Some(urlname) = group.urlname.clone() {
                by_urlname.insert(urlname, group);
            }
        }
    }

    let mut tx = pool.begin().await?;
    for group in by_urlname.values() {
        db::upsert_group(&mut *tx, group, first_sync_sentinel()).await?;
    }
    tx.commit().await?;

    info!(filters = filters.len(), groups = by_urlname.len(), "targets discovered");
    Ok(by_urlname.into_values().collect())
}
