//! Browsing contexts the worker claims and verifies through.
//!
//! The claim loop drives one long-lived primary context. The verifier opens a
//! fresh context per batch and closes it afterwards, so verification never
//! disturbs the primary context's page.

use async_trait::async_trait;

use super::feed::Location;
use super::locator::{Control, Document};
use crate::errors::WorkerError;

#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>, WorkerError>;
}

#[async_trait]
pub trait BrowsingContext: Send {
    /// Load `url` and return a snapshot of the page.
    async fn navigate(&mut self, url: &str) -> Result<Document, WorkerError>;

    /// Act on a control of the current page.
    async fn activate(&mut self, control: &Control) -> Result<(), WorkerError>;

    async fn close(&mut self);
}

/// Browser over serialized page snapshots, fetched from files or HTTP.
///
/// Activating a control on an HTTP page follows the control's target with a
/// GET. Controls on file pages and controls without a target only get logged.
#[derive(Clone)]
pub struct SnapshotBrowser {
    client: reqwest::Client,
}

impl SnapshotBrowser {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Browser for SnapshotBrowser {
    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>, WorkerError> {
        Ok(Box::new(SnapshotContext {
            client: self.client.clone(),
            current: None,
            closed: false,
        }))
    }
}

struct SnapshotContext {
    client: reqwest::Client,
    current: Option<Location>,
    closed: bool,
}

impl SnapshotContext {
    fn target_url(&self, control: &Control) -> Option<reqwest::Url> {
        let href = control.href.as_deref()?.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
            return None;
        }
        match &self.current {
            Some(Location::Http(base)) => reqwest::Url::parse(base).ok()?.join(href).ok(),
            _ => reqwest::Url::parse(href)
                .ok()
                .filter(|u| matches!(u.scheme(), "http" | "https")),
        }
    }
}

#[async_trait]
impl BrowsingContext for SnapshotContext {
    async fn navigate(&mut self, url: &str) -> Result<Document, WorkerError> {
        if self.closed {
            return Err(WorkerError::Browser("context is closed".into()));
        }
        let location = Location::parse(url)?;
        let body = location
            .read(&self.client)
            .await
            .map_err(|e| WorkerError::Browser(e.to_string()))?;
        let doc = Document::parse(&body)?;
        self.current = Some(location);
        Ok(doc)
    }

    async fn activate(&mut self, control: &Control) -> Result<(), WorkerError> {
        if self.closed {
            return Err(WorkerError::Browser("context is closed".into()));
        }
        let Some(url) = self.target_url(control) else {
            tracing::debug!(control = %control.path, label = %control.label, "Activated control without a followable target");
            return Ok(());
        };
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| WorkerError::Browser(format!("GET {}: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(WorkerError::Browser(format!("GET {}: HTTP {}", url, status)));
        }
        tracing::debug!(%url, %status, "Followed control target");
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::feed::http_client;
    use std::time::Duration;

    fn control(href: Option<&str>) -> Control {
        Control {
            node: 1,
            label: "Buy".into(),
            href: href.map(String::from),
            path: "body[0] > a[0]".into(),
            strategy: "anchor_link",
        }
    }

    fn context(current: Option<Location>) -> SnapshotContext {
        SnapshotContext {
            client: http_client(Duration::from_secs(1)).unwrap(),
            current,
            closed: false,
        }
    }

    #[test]
    fn test_relative_targets_resolve_against_http_pages() {
        let ctx = context(Some(Location::Http("https://market.example/feed/page".into())));
        assert_eq!(
            ctx.target_url(&control(Some("/claim/42"))).unwrap().as_str(),
            "https://market.example/claim/42"
        );
        assert!(ctx.target_url(&control(Some("#"))).is_none());
        assert!(ctx.target_url(&control(None)).is_none());
    }

    #[test]
    fn test_file_pages_only_follow_absolute_http_targets() {
        let ctx = context(Some(Location::File("page.json".into())));
        assert!(ctx.target_url(&control(Some("/claim/42"))).is_none());
        assert!(ctx.target_url(&control(Some("https://x.example/c"))).is_some());
    }

    #[tokio::test]
    async fn test_navigate_file_snapshot_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("page.json");
        std::fs::write(
            &page,
            r#"{"tag": "body", "children": [{"tag": "button", "text": "Buy"}]}"#,
        )
        .unwrap();

        let browser = SnapshotBrowser::new(http_client(Duration::from_secs(1)).unwrap());
        let mut ctx = browser.new_context().await.unwrap();
        let doc = ctx.navigate(page.to_str().unwrap()).await.unwrap();
        assert_eq!(doc.len(), 2);
        ctx.activate(&control(Some("/claim/1"))).await.unwrap();

        ctx.close().await;
        assert!(ctx.navigate(page.to_str().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_navigate_missing_page_is_browser_error() {
        let browser = SnapshotBrowser::new(http_client(Duration::from_secs(1)).unwrap());
        let mut ctx = browser.new_context().await.unwrap();
        assert!(matches!(
            ctx.navigate("/nonexistent/page.json").await,
            Err(WorkerError::Browser(_))
        ));
    }
}
