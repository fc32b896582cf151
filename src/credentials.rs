//! OAuth credential lifecycle for the meetup.com API and the warehouse.
//!
//! The store owns the singleton credential row. Tokens are refreshed once
//! `expires_at` has passed; `expires_at` is set to half the advertised
//! lifetime so a token is never served close to its real expiry.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::fmt;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::client::AccessTokenProvider;
use crate::config;
use crate::db::{self, Credential, Pool};
use crate::error::SyncError;

#[derive(Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: Url,
    pub authorize_url: Url,
}

impl fmt::Debug for OAuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthSettings")
            .field("client_id", &self.client_id)
            .field("token_url", &self.token_url)
            .field("authorize_url", &self.authorize_url)
            .finish_non_exhaustive()
    }
}

impl OAuthSettings {
    pub fn from_config(cfg: &config::Meetup) -> Result<Self, SyncError> {
        let parse = |raw: &str| Url::parse(raw).map_err(|e| SyncError::InvalidUrl(format!("{raw}: {e}")));
        Ok(Self {
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            token_url: parse(&cfg.token_url)?,
            authorize_url: parse(&cfg.authorize_url)?,
        })
    }
}

/// Token endpoint response.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

impl TokenGrant {
    fn into_credential(
        self,
        previous_refresh_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Credential, SyncError> {
        let expires_at = half_life_expiry(now, self.expires_in)?;
        let refresh_token = self
            .refresh_token
            .or_else(|| previous_refresh_token.map(str::to_string))
            .ok_or(SyncError::MissingCredentials)?;
        Ok(Credential {
            access_token: self.access_token,
            refresh_token,
            expires_at,
        })
    }
}

/// `now + expires_in / 2`. Non-positive or unrepresentable lifetimes are
/// rejected so a bad grant is never persisted.
pub fn half_life_expiry(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>, SyncError> {
    if expires_in <= 0 {
        return Err(SyncError::InvalidGrant(format!(
            "expires_in must be positive, got {expires_in}"
        )));
    }
    Duration::try_seconds(expires_in / 2)
        .and_then(|half| now.checked_add_signed(half))
        .ok_or_else(|| SyncError::InvalidGrant(format!("expires_in out of range: {expires_in}")))
}

fn http_client() -> Client {
    Client::builder()
        .user_agent(concat!("meetup-sync/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("reqwest client")
}

/// POST a form-encoded grant to `token_url` with the client credentials.
async fn request_token(
    http: &Client,
    token_url: &Url,
    client_id: &str,
    client_secret: &str,
    grant: &[(&str, &str)],
) -> Result<TokenGrant, SyncError> {
    let mut form = vec![("client_id", client_id), ("client_secret", client_secret)];
    form.extend_from_slice(grant);

    let res = http.post(token_url.clone()).form(&form).send().await?;
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        warn!(%status, token_url = %token_url, "token endpoint rejected grant");
        return Err(SyncError::UpstreamAuth {
            status: status.as_u16(),
            body,
        });
    }
    Ok(res.json().await?)
}

pub struct CredentialStore {
    pool: Pool,
    http: Client,
    oauth: OAuthSettings,
    refresh_lock: Mutex<()>,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("oauth", &self.oauth)
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    pub fn new(pool: Pool, oauth: OAuthSettings) -> Self {
        Self {
            pool,
            http: http_client(),
            oauth,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Current access token, refreshed first when expired.
    ///
    /// Refreshes are serialized in-process by a mutex and across processes by
    /// a compare-and-set on the old refresh token; a caller that loses the
    /// race returns the winner's token.
    #[instrument(skip_all)]
    pub async fn get_access_token(&self) -> Result<String, SyncError> {
        let cred = self.load().await?;
        if cred.expires_at > Utc::now() {
            return Ok(cred.access_token);
        }

        let _guard = self.refresh_lock.lock().await;
        let cred = self.load().await?;
        if cred.expires_at > Utc::now() {
            return Ok(cred.access_token);
        }

        let grant = self
            .request_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", cred.refresh_token.as_str()),
            ])
            .await?;
        let fresh = grant.into_credential(Some(&cred.refresh_token), Utc::now())?;

        if db::swap_credential(&self.pool, &cred.refresh_token, &fresh).await? {
            info!(expires_at = %fresh.expires_at, "access token refreshed");
            Ok(fresh.access_token)
        } else {
            warn!("credential changed during refresh, using stored token");
            Ok(self.load().await?.access_token)
        }
    }

    /// Store a token grant as the singleton credential, replacing any previous one.
    #[instrument(skip_all)]
    pub async fn update_from_oauth(&self, grant: TokenGrant) -> Result<Credential, SyncError> {
        let previous = db::load_credential(&self.pool).await?;
        let cred =
            grant.into_credential(previous.as_ref().map(|c| c.refresh_token.as_str()), Utc::now())?;
        db::upsert_credential(&self.pool, &cred).await?;
        info!(expires_at = %cred.expires_at, "credential stored");
        Ok(cred)
    }

    /// Provider page the user is sent to for the authorization-code handshake.
    pub fn authorize_url(&self, redirect_uri: &str) -> Url {
        let mut url = self.oauth.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.oauth.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri);
        url
    }

    #[instrument(skip_all)]
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<Credential, SyncError> {
        let grant = self
            .request_token(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .await?;
        self.update_from_oauth(grant).await
    }

    async fn load(&self) -> Result<Credential, SyncError> {
        db::load_credential(&self.pool)
            .await?
            .ok_or(SyncError::MissingCredentials)
    }

    async fn request_token(&self, grant: &[(&str, &str)]) -> Result<TokenGrant, SyncError> {
        request_token(
            &self.http,
            &self.oauth.token_url,
            &self.oauth.client_id,
            &self.oauth.client_secret,
            grant,
        )
        .await
    }
}

#[async_trait]
impl AccessTokenProvider for CredentialStore {
    async fn access_token(&self) -> Result<String, SyncError> {
        self.get_access_token().await
    }
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// In-memory access token minted from a long-lived refresh token, e.g. a
/// Google OAuth client for the warehouse. Refreshed at half its lifetime.
pub struct RefreshingToken {
    http: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    cached: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for RefreshingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshingToken")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl RefreshingToken {
    pub fn new(token_url: Url, client_id: String, client_secret: String, refresh_token: String) -> Self {
        Self {
            http: http_client(),
            token_url,
            client_id,
            client_secret,
            refresh_token,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AccessTokenProvider for RefreshingToken {
    async fn access_token(&self) -> Result<String, SyncError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.expires_at > Utc::now()) {
            return Ok(token.access_token.clone());
        }

        let grant = request_token(
            &self.http,
            &self.token_url,
            &self.client_id,
            &self.client_secret,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.as_str()),
            ],
        )
        .await?;
        let expires_at = half_life_expiry(Utc::now(), grant.expires_in)?;
        info!(%expires_at, "access token minted");
        *cached = Some(CachedToken {
            access_token: grant.access_token.clone(),
            expires_at,
        });
        Ok(grant.access_token)
    }
}
