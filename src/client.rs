//! Authenticated, lazily paginated meetup.com API client.
//!
//! Two pagination conventions exist upstream, chosen per endpoint:
//! [`Pagination::CursorInBody`] (`{results, meta: {next}}`) and
//! [`Pagination::LinkHeader`] (bare array plus `Link: <url>; rel="next"`).

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, LINK};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::mapper::ApiRecord;
use crate::records::{Category, Group, GroupMember};

const MEETUP_API_BASE: &str = "https://api.meetup.com/";

/// Requested page size; a hint only, pages may hold fewer items.
pub const DEFAULT_PAGE_SIZE: u32 = 2000;

/// Source of bearer tokens. Asked once per page so a refresh mid-iteration
/// is picked up transparently.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, SyncError>;
}

/// A fixed token, for tools and tests that already hold one.
#[derive(Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl AccessTokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, SyncError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    CursorInBody,
    LinkHeader,
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    page_size: u32,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct CursorPage {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    meta: Option<CursorMeta>,
}

#[derive(Deserialize)]
struct CursorMeta {
    #[serde(default)]
    next: Option<String>,
}

struct Page {
    items: Vec<Value>,
    next: Option<Url>,
}

impl ApiClient {
    pub fn new(tokens: Arc<dyn AccessTokenProvider>) -> Self {
        let base_url = Url::parse(MEETUP_API_BASE).expect("valid default meetup URL");
        Self::with_base_url(tokens, base_url)
    }

    pub fn with_base_url(tokens: Arc<dyn AccessTokenProvider>, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent(concat!("meetup-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            page_size: DEFAULT_PAGE_SIZE,
            tokens,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn endpoint_url(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        page_size: u32,
    ) -> Result<Url, SyncError> {
        let mut url = self
            .base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| SyncError::InvalidUrl(format!("{endpoint}: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
            query.append_pair("page", &page_size.to_string());
        }
        Ok(url)
    }

    /// Lazily walk every page of `endpoint`. A page is requested only once the
    /// previous one has been consumed. The first non-2xx response ends the
    /// stream with `SyncError::UpstreamRequest`.
    pub fn iterate(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        page_size: u32,
        pagination: Pagination,
    ) -> BoxStream<'_, Result<Value, SyncError>> {
        let first = match self.endpoint_url(endpoint, params, page_size) {
            Ok(url) => url,
            Err(err) => return stream::once(async move { Err(err) }).boxed(),
        };

        stream::try_unfold(
            (Some(first), VecDeque::new()),
            move |(mut next, mut buffered)| async move {
                loop {
                    if let Some(item) = buffered.pop_front() {
                        return Ok::<_, SyncError>(Some((item, (next, buffered))));
                    }
                    let Some(url) = next.take() else {
                        return Ok(None);
                    };
                    let page = self.fetch_page(url, pagination).await?;
                    buffered.extend(page.items);
                    next = page.next;
                }
            },
        )
        .boxed()
    }

    async fn fetch_page(&self, url: Url, pagination: Pagination) -> Result<Page, SyncError> {
        let token = self.tokens.access_token().await?;
        debug!(url = %url, "GET page");
        let res = self.http.get(url.clone()).bearer_auth(token).send().await?;

        let status = res.status();
        if !status.is_success() {
            warn!(%status, url = %url, "page request failed");
            return Err(SyncError::UpstreamRequest {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        match pagination {
            Pagination::CursorInBody => {
                let page: CursorPage = res.json().await?;
                let next = page
                    .meta
                    .and_then(|m| m.next)
                    .filter(|n| !n.trim().is_empty())
                    .map(|n| resolve(&url, &n))
                    .transpose()?;
                Ok(Page {
                    items: page.results,
                    next,
                })
            }
            Pagination::LinkHeader => {
                let next = next_link(res.headers())
                    .map(|n| resolve(&url, &n))
                    .transpose()?;
                let items: Vec<Value> = res.json().await?;
                Ok(Page { items, next })
            }
        }
    }

    /// `2/categories`.
    pub fn categories(&self) -> BoxStream<'_, Result<Category, SyncError>> {
        self.iterate("2/categories", &[], self.page_size, Pagination::CursorInBody)
            .map_ok(|raw| Category::from_json(&raw))
            .boxed()
    }

    /// `find/groups` for one category around one location.
    pub fn find_groups(
        &self,
        category_id: i64,
        country: &str,
        location: &str,
    ) -> BoxStream<'_, Result<Group, SyncError>> {
        let category = category_id.to_string();
        let params = [
            ("fallback_suggestions", "0"),
            ("self_groups", "include"),
            ("category", category.as_str()),
            ("country", country),
            ("location", location),
        ];
        self.iterate("find/groups", &params, self.page_size, Pagination::LinkHeader)
            .map_ok(|raw| Group::from_json(&raw))
            .boxed()
    }

    /// `<urlname>/members`, including messaging and privacy settings.
    pub fn group_members(&self, urlname: &str) -> BoxStream<'_, Result<GroupMember, SyncError>> {
        let params = [("fields", "messaging_pref,privacy")];
        self.iterate(
            &format!("{urlname}/members"),
            &params,
            self.page_size,
            Pagination::LinkHeader,
        )
        .map_ok(|raw| GroupMember::from_json(&raw))
        .boxed()
    }
}

fn resolve(current: &Url, next: &str) -> Result<Url, SyncError> {
    current
        .join(next)
        .map_err(|e| SyncError::InvalidUrl(format!("{next}: {e}")))
}

static LINK_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([^>]*)>([^,<]*)").expect("valid link entry regex"));
static REL_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i);\s*rel\s*=\s*(?:"([^"]*)"|([^\s;,"]+))"#).expect("valid rel regex")
});

/// Parse an RFC 8288 `Link` value into `(target, relations)` pairs.
pub fn parse_link_header(value: &str) -> Vec<(String, Vec<String>)> {
    LINK_ENTRY
        .captures_iter(value)
        .map(|entry| {
            let target = entry[1].trim().to_string();
            let rels = REL_PARAM
                .captures(&entry[2])
                .and_then(|c| c.get(1).or_else(|| c.get(2)))
                .map(|m| {
                    m.as_str()
                        .split_whitespace()
                        .map(|r| r.to_ascii_lowercase())
                        .collect()
                })
                .unwrap_or_default();
            (target, rels)
        })
        .collect()
}

/// Target of the first `rel="next"` entry across all `Link` headers.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(parse_link_header)
        .find(|(_, rels)| rels.iter().any(|r| r == "next"))
        .map(|(target, _)| target)
}
