//! Candidate feed: the live list of items a worker scans.
//!
//! A feed snapshot is JSON:
//!
//! ```json
//! {
//!   "generated_at": "2026-10-18T09:00:00Z",
//!   "session_valid": true,
//!   "items": [
//!     {"id": "42", "title": "Steel pipes", "text": "...", "region": "DE",
//!      "age_text": "5 mins ago",
//!      "contact": {"email": "a@b.de", "email_verified": true}}
//!   ]
//! }
//! ```
//!
//! Sources are `http(s)://` URLs or local paths (optionally `file://`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::WorkerError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub phone_verified: bool,
}

impl Contact {
    pub fn has_email(&self) -> bool {
        self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    pub fn has_phone(&self) -> bool {
        self.phone.as_deref().is_some_and(|p| !p.trim().is_empty())
    }

    pub fn has_verified_channel(&self) -> bool {
        (self.has_email() && self.email_verified) || (self.has_phone() && self.phone_verified)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub region: Option<String>,
    /// When the item was posted, by the feed's clock.
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
    /// Age as computed by the feed.
    #[serde(default)]
    pub age_seconds: Option<u64>,
    /// Relative age as displayed by the feed, e.g. "5 mins ago".
    #[serde(default)]
    pub age_text: Option<String>,
    #[serde(default)]
    pub contact: Contact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    /// The feed's own timestamp for this snapshot.
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default = "default_session_valid")]
    pub session_valid: bool,
    #[serde(default)]
    pub items: Vec<FeedItem>,
}

fn default_session_valid() -> bool {
    true
}

#[async_trait]
pub trait CandidateFeed: Send {
    /// Fetch the freshest slice of the feed.
    async fn fetch(&mut self) -> Result<FeedSnapshot, WorkerError>;
}

/// Where a source location points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Http(String),
    File(PathBuf),
}

impl Location {
    pub fn parse(raw: &str) -> Result<Self, WorkerError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(WorkerError::InvalidConfig("empty source location".into()));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Ok(Location::Http(raw.to_string()))
        } else {
            Ok(Location::File(PathBuf::from(
                raw.strip_prefix("file://").unwrap_or(raw),
            )))
        }
    }

    /// Read the location's body as text.
    pub async fn read(&self, client: &reqwest::Client) -> Result<String, WorkerError> {
        match self {
            Location::Http(url) => {
                let response = client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| WorkerError::Feed(format!("GET {}: {}", url, e)))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(WorkerError::Feed(format!("GET {}: HTTP {}", url, status)));
                }
                response
                    .text()
                    .await
                    .map_err(|e| WorkerError::Feed(format!("GET {}: {}", url, e)))
            }
            Location::File(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| WorkerError::Feed(format!("read {}: {}", path.display(), e))),
        }
    }
}

/// Build the HTTP client shared by the feed and the browser.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, WorkerError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("slotwarden/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| WorkerError::Other(anyhow::anyhow!("failed to build HTTP client: {}", e)))
}

/// Feed read from a file or URL on every fetch.
pub struct SourceFeed {
    location: Location,
    client: reqwest::Client,
}

impl SourceFeed {
    pub fn new(location: Location, client: reqwest::Client) -> Self {
        Self { location, client }
    }
}

#[async_trait]
impl CandidateFeed for SourceFeed {
    async fn fetch(&mut self) -> Result<FeedSnapshot, WorkerError> {
        let body = self.location.read(&self.client).await?;
        parse_snapshot(&body)
    }
}

pub fn parse_snapshot(body: &str) -> Result<FeedSnapshot, WorkerError> {
    serde_json::from_str(body).map_err(|e| WorkerError::Feed(format!("malformed feed: {}", e)))
}
