//! CalDAV transport: create and delete single `.ics` resources in a
//! calendar collection.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use url::Url;

use crate::config::CalDavConfig;
use crate::error::{truncate_chars, AppError, AppResult, SyncError, TransportErrorKind};
use crate::services::ics::EventDocument;

const CALENDAR_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";
const BODY_EXCERPT_LEN: usize = 200;

/// Normalize a collection URL into its server identity.
///
/// Only `http`/`https` with a host are accepted. Userinfo, query and fragment
/// are dropped, the host is lowercased by the parser and the path always ends
/// with `/`, so two spellings of the same collection compare equal.
pub fn normalize_collection_url(raw: &str) -> Result<Url, SyncError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Configuration(
            "CalDAV server URL is empty".to_string(),
        ));
    }

    let mut url = Url::parse(trimmed)
        .map_err(|e| SyncError::Configuration(format!("Invalid CalDAV server URL: {}", e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(SyncError::Configuration(format!(
            "Unsupported CalDAV URL scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(SyncError::Configuration(
            "CalDAV server URL has no host".to_string(),
        ));
    }

    // Credentials come from the config, never from the URL
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_query(None);
    url.set_fragment(None);

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

/// One validated remote collection plus the credentials to reach it.
#[derive(Clone, PartialEq)]
pub struct CalDavTarget {
    base: Url,
    username: String,
    password: String,
}

impl fmt::Debug for CalDavTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalDavTarget")
            .field("base", &self.base.as_str())
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl CalDavTarget {
    /// Validate a target. Fails with [`SyncError::Configuration`] before any
    /// network call when the URL is unusable or a credential is missing.
    pub fn new(server_url: &str, username: &str, password: &str) -> Result<Self, SyncError> {
        let base = normalize_collection_url(server_url)?;

        if username.trim().is_empty() {
            return Err(SyncError::Configuration(
                "CalDAV username is missing".to_string(),
            ));
        }
        if password.is_empty() {
            return Err(SyncError::Configuration(
                "CalDAV password is missing".to_string(),
            ));
        }

        Ok(Self {
            base,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// The normalized collection URL. Targets with the same identity are the
    /// same remote calendar.
    pub fn identity(&self) -> &str {
        self.base.as_str()
    }

    /// `{base}{uid}.ics`, with the UID percent-encoded as a single path segment.
    pub fn event_url(&self, uid: &str) -> Result<Url, SyncError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                SyncError::Configuration(format!(
                    "CalDAV URL cannot hold event paths: {}",
                    self.base
                ))
            })?
            .pop_if_empty()
            .push(&format!("{}.ics", uid));
        Ok(url)
    }
}

/// What the server reported for a created event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedEvent {
    pub uid: String,
    pub href: String,
    pub etag: Option<String>,
}

/// Network operations against one remote calendar collection.
#[async_trait]
pub trait CalDavTransport: Send + Sync {
    /// PUT `document` at `{base}{document.uid}.ics`, refusing to overwrite an
    /// existing resource.
    async fn create_event(
        &self,
        target: &CalDavTarget,
        document: &EventDocument,
    ) -> Result<CreatedEvent, SyncError>;

    /// DELETE `{base}{uid}.ics`. A missing resource counts as deleted.
    async fn delete_event(&self, target: &CalDavTarget, uid: &str) -> Result<(), SyncError>;
}

/// `reqwest`-backed [`CalDavTransport`].
#[derive(Clone)]
pub struct HttpCalDavClient {
    client: reqwest::Client,
}

impl HttpCalDavClient {
    pub fn new(timeout: Duration, user_agent: &str) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn from_config(config: &CalDavConfig) -> AppResult<Self> {
        Self::new(
            Duration::from_secs(config.request_timeout_seconds),
            &config.user_agent,
        )
    }

    fn send_error(action: &str, e: reqwest::Error) -> SyncError {
        // Timeouts, refused connections and resets are all worth another try
        let message = if e.is_timeout() {
            format!("{} timed out", action)
        } else {
            format!("{} failed: {}", action, e.without_url())
        };
        SyncError::transport(TransportErrorKind::Transient, None, message)
    }

    async fn status_error(action: &str, response: reqwest::Response) -> SyncError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let excerpt = truncate_chars(body.trim(), BODY_EXCERPT_LEN);

        let message = if excerpt.is_empty() {
            format!("{} rejected", action)
        } else {
            format!("{} rejected: {}", action, excerpt)
        };

        SyncError::transport(
            TransportErrorKind::from_status(status.as_u16()),
            Some(status.as_u16()),
            message,
        )
    }
}

#[async_trait]
impl CalDavTransport for HttpCalDavClient {
    async fn create_event(
        &self,
        target: &CalDavTarget,
        document: &EventDocument,
    ) -> Result<CreatedEvent, SyncError> {
        let url = target.event_url(&document.uid)?;

        tracing::debug!("PUT CalDAV event {} at {}", document.uid, target.identity());

        let response = self
            .client
            .put(url.clone())
            .basic_auth(&target.username, Some(&target.password))
            .header(header::CONTENT_TYPE, CALENDAR_CONTENT_TYPE)
            .header(header::IF_NONE_MATCH, "*")
            .body(document.body.clone())
            .send()
            .await
            .map_err(|e| Self::send_error("Create event", e))?;

        if !response.status().is_success() {
            return Err(Self::status_error("Create event", response).await);
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(CreatedEvent {
            uid: document.uid.clone(),
            href: url.path().to_string(),
            etag,
        })
    }

    async fn delete_event(&self, target: &CalDavTarget, uid: &str) -> Result<(), SyncError> {
        let url = target.event_url(uid)?;

        tracing::debug!("DELETE CalDAV event {} at {}", uid, target.identity());

        let response = self
            .client
            .delete(url)
            .basic_auth(&target.username, Some(&target.password))
            .send()
            .await
            .map_err(|e| Self::send_error("Delete event", e))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }

        Err(Self::status_error("Delete event", response).await)
    }
}
