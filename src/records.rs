//! Typed meetup.com API records and their field tables.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mapper::{ApiRecord, FieldDefault, FieldDescriptor, Record};
use crate::upload::timestamp_format;

/// Group category, e.g. "tech" (https://www.meetup.com/meetup_api/docs/2/categories/).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Category {
    pub id: Option<i64>,
    pub shortname: Option<String>,
    pub name: Option<String>,
}

impl ApiRecord for Category {
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::integer("id", "/id"),
        FieldDescriptor::raw("shortname", "/shortname"),
        FieldDescriptor::raw("name", "/name"),
    ];

    fn from_record(r: &Record) -> Self {
        Self {
            id: r.integer("id"),
            shortname: r.text("shortname"),
            name: r.text("name"),
        }
    }
}

/// Interest group as returned by `find/groups`. `urlname` is its natural key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Group {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub urlname: Option<String>,
    pub description: Option<String>,
    #[serde(serialize_with = "timestamp_format::serialize")]
    pub created: Option<DateTime<Utc>>,
    pub city: Option<String>,
    pub untranslated_city: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub join_mode: Option<String>,
    pub visibility: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub members: Option<i64>,
    pub who: Option<String>,
    pub organizer_id: Option<i64>,
    pub organizer_name: Option<String>,
    pub timezone: Option<String>,
    pub next_event_id: Option<String>,
    pub next_event_name: Option<String>,
    pub next_event_yes_rsvp_count: Option<i64>,
    #[serde(serialize_with = "timestamp_format::serialize")]
    pub next_event_time: Option<DateTime<Utc>>,
    pub category_id: Option<i64>,
    pub category_shortname: Option<String>,
    pub meta_category_id: Option<i64>,
    pub meta_category_shortname: Option<String>,
}

impl ApiRecord for Group {
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::integer("id", "/id"),
        FieldDescriptor::raw("name", "/name"),
        FieldDescriptor::raw("status", "/status"),
        FieldDescriptor::raw("urlname", "/urlname"),
        FieldDescriptor::raw("description", "/description"),
        FieldDescriptor::timestamp("created", "/created"),
        FieldDescriptor::raw("city", "/city"),
        FieldDescriptor::raw("untranslated_city", "/untranslated_city"),
        FieldDescriptor::raw("country", "/country"),
        FieldDescriptor::raw("state", "/state"),
        FieldDescriptor::raw("join_mode", "/join_mode"),
        FieldDescriptor::raw("visibility", "/visibility"),
        FieldDescriptor::raw("lat", "/lat"),
        FieldDescriptor::raw("lon", "/lon"),
        FieldDescriptor::integer("members", "/members"),
        FieldDescriptor::raw("who", "/who"),
        FieldDescriptor::integer("organizer_id", "/organizer/id"),
        FieldDescriptor::raw("organizer_name", "/organizer/name"),
        FieldDescriptor::raw("timezone", "/timezone"),
        FieldDescriptor::raw("next_event_id", "/next_event/id"),
        FieldDescriptor::raw("next_event_name", "/next_event/name"),
        FieldDescriptor::integer("next_event_yes_rsvp_count", "/next_event/yes_rsvp_count"),
        FieldDescriptor::timestamp("next_event_time", "/next_event/time"),
        FieldDescriptor::integer("category_id", "/category/id"),
        FieldDescriptor::raw("category_shortname", "/category/shortname"),
        FieldDescriptor::integer("meta_category_id", "/meta_category/id"),
        FieldDescriptor::raw("meta_category_shortname", "/meta_category/shortname"),
    ];

    fn from_record(r: &Record) -> Self {
        Self {
            id: r.integer("id"),
            name: r.text("name"),
            status: r.text("status"),
            urlname: r.text("urlname"),
            description: r.text("description"),
            created: r.timestamp("created"),
            city: r.text("city"),
            untranslated_city: r.text("untranslated_city"),
            country: r.text("country"),
            state: r.text("state"),
            join_mode: r.text("join_mode"),
            visibility: r.text("visibility"),
            lat: r.float("lat"),
            lon: r.float("lon"),
            members: r.integer("members"),
            who: r.text("who"),
            organizer_id: r.integer("organizer_id"),
            organizer_name: r.text("organizer_name"),
            timezone: r.text("timezone"),
            next_event_id: r.text("next_event_id"),
            next_event_name: r.text("next_event_name"),
            next_event_yes_rsvp_count: r.integer("next_event_yes_rsvp_count"),
            next_event_time: r.timestamp("next_event_time"),
            category_id: r.integer("category_id"),
            category_shortname: r.text("category_shortname"),
            meta_category_id: r.integer("meta_category_id"),
            meta_category_shortname: r.text("meta_category_shortname"),
        }
    }
}

/// A member of one group: the user profile plus the group-specific profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMember {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub status: Option<String>,
    #[serde(serialize_with = "timestamp_format::serialize")]
    pub joined: Option<DateTime<Utc>>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub group_status: Option<String>,
    #[serde(serialize_with = "timestamp_format::serialize")]
    pub group_visited: Option<DateTime<Utc>>,
    #[serde(serialize_with = "timestamp_format::serialize")]
    pub group_created: Option<DateTime<Utc>>,
    #[serde(serialize_with = "timestamp_format::serialize")]
    pub group_updated: Option<DateTime<Utc>>,
    pub group_role: Option<String>,
    pub group_id: Option<i64>,
    pub group_urlname: Option<String>,
    pub group_link: Option<String>,
    pub is_pro_admin: Option<bool>,
    pub messaging_pref: Option<String>,
    pub privacy_bio: Option<String>,
    pub privacy_groups: Option<String>,
    pub privacy_topics: Option<String>,
}

impl ApiRecord for GroupMember {
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::integer("id", "/id"),
        FieldDescriptor::raw("name", "/name"),
        FieldDescriptor::raw("status", "/status"),
        FieldDescriptor::timestamp("joined", "/joined"),
        FieldDescriptor::raw("city", "/city"),
        FieldDescriptor::raw("country", "/country"),
        FieldDescriptor::raw("lat", "/lat"),
        FieldDescriptor::raw("lon", "/lon"),
        FieldDescriptor::raw("group_status", "/group_profile/status"),
        FieldDescriptor::timestamp("group_visited", "/group_profile/visited"),
        FieldDescriptor::timestamp("group_created", "/group_profile/created"),
        FieldDescriptor::timestamp("group_updated", "/group_profile/updated"),
        FieldDescriptor::raw("group_role", "/group_profile/role"),
        FieldDescriptor::integer("group_id", "/group_profile/group/id"),
        FieldDescriptor::raw("group_urlname", "/group_profile/group/urlname"),
        FieldDescriptor::raw("group_link", "/group_profile/link"),
        FieldDescriptor::raw("is_pro_admin", "/is_pro_admin").with_default(FieldDefault::Bool(false)),
        FieldDescriptor::raw("messaging_pref", "/messaging_pref"),
        FieldDescriptor::raw("privacy_bio", "/privacy/bio"),
        FieldDescriptor::raw("privacy_groups", "/privacy/groups"),
        FieldDescriptor::raw("privacy_topics", "/privacy/topics"),
    ];

    fn from_record(r: &Record) -> Self {
        Self {
            id: r.integer("id"),
            name: r.text("name"),
            status: r.text("status"),
            joined: r.timestamp("joined"),
            city: r.text("city"),
            country: r.text("country"),
            lat: r.float("lat"),
            lon: r.float("lon"),
            group_status: r.text("group_status"),
            group_visited: r.timestamp("group_visited"),
            group_created: r.timestamp("group_created"),
            group_updated: r.timestamp("group_updated"),
            group_role: r.text("group_role"),
            group_id: r.integer("group_id"),
            group_urlname: r.text("group_urlname"),
            group_link: r.text("group_link"),
            is_pro_admin: r.boolean("is_pro_admin"),
            messaging_pref: r.text("messaging_pref"),
            privacy_bio: r.text("privacy_bio"),
            privacy_groups: r.text("privacy_groups"),
            privacy_topics: r.text("privacy_topics"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn group_maps_nested_fields_and_tolerates_missing_ones() {
        let raw = json!({
            "id": 18_354_966,
            "name": "Python Porto",
            "urlname": "pyporto",
            "visibility": "public",
            "created": 1_426_852_800_000_i64,
            "lat": 41.15,
            "lon": -8.61,
            "members": 812,
            "organizer": { "id": 123, "name": "Ana" },
            "category": { "id": 34, "shortname": "tech" },
            "unexpected": { "nested": true }
        });
        let group = Group::from_json(&raw);

        assert_eq!(group.id, Some(18_354_966));
        assert_eq!(group.urlname.as_deref(), Some("pyporto"));
        assert_eq!(group.organizer_id, Some(123));
        assert_eq!(group.organizer_name.as_deref(), Some("Ana"));
        assert_eq!(group.category_shortname.as_deref(), Some("tech"));
        assert_eq!(group.lat, Some(41.15));
        assert_eq!(
            group.created.map(|c| c.to_rfc3339()),
            Some("2015-03-20T12:00:00+00:00".to_string())
        );
        assert!(group.next_event_id.is_none());
        assert!(group.next_event_time.is_none());
        assert!(group.meta_category_id.is_none());
    }

    #[test]
    fn member_defaults_pro_admin_to_false() {
        let raw = json!({
            "id": 5,
            "name": "Bruno",
            "group_profile": {
                "status": "active",
                "role": "organizer",
                "created": 1_500_000_000_000_i64,
                "group": { "id": 18_354_966, "urlname": "pyporto" }
            },
            "privacy": { "bio": "visible" }
        });
        let member = GroupMember::from_json(&raw);

        assert_eq!(member.id, Some(5));
        assert_eq!(member.is_pro_admin, Some(false));
        assert_eq!(member.group_role.as_deref(), Some("organizer"));
        assert_eq!(member.group_urlname.as_deref(), Some("pyporto"));
        assert_eq!(member.privacy_bio.as_deref(), Some("visible"));
        assert!(member.group_created.is_some());
        assert!(member.group_visited.is_none());
        assert!(member.privacy_topics.is_none());
    }

    #[test]
    fn category_accepts_string_ids() {
        let category = Category::from_json(&json!({ "id": "34", "shortname": "tech", "name": "Tech" }));
        assert_eq!(category.id, Some(34));
        assert_eq!(category.name.as_deref(), Some("Tech"));
    }
}
