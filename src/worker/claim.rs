use slotwarden_common::RejectReason;

use super::browser::BrowsingContext;
use super::feed::FeedItem;
use super::locator::{Document, Locator};

/// What happened when one item was claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    Captured { control: String },
    Rejected { reason: RejectReason, error: Option<String> },
}

/// Claims items on an already loaded claim page.
pub struct Claimer {
    locator: Locator,
}

impl Default for Claimer {
    fn default() -> Self {
        Self::new(Locator::default())
    }
}

impl Claimer {
    pub fn new(locator: Locator) -> Self {
        Self { locator }
    }

    pub async fn claim(
        &self,
        context: &mut dyn BrowsingContext,
        page: &Document,
        item: &FeedItem,
    ) -> ClaimResult {
        let Some(control) = self.locator.locate(page, item) else {
            tracing::warn!(item = %item.id, title = %item.title, "No claim control found");
            return ClaimResult::Rejected {
                reason: RejectReason::ControlNotFound,
                error: None,
            };
        };
        match context.activate(&control).await {
            Ok(()) => {
                tracing::info!(item = %item.id, strategy = control.strategy, label = %control.label, "Claimed item");
                ClaimResult::Captured {
                    control: control.path,
                }
            }
            Err(e) => {
                tracing::warn!(item = %item.id, error = %e, "Claim control failed");
                ClaimResult::Rejected {
                    reason: RejectReason::ClaimFailed,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::WorkerError;
    use crate::worker::locator::Control;
    use async_trait::async_trait;

    struct Ctx {
        fail: bool,
        activated: Vec<String>,
    }

    #[async_trait]
    impl BrowsingContext for Ctx {
        async fn navigate(&mut self, _url: &str) -> Result<Document, WorkerError> {
            Err(WorkerError::Browser("unused".into()))
        }

        async fn activate(&mut self, control: &Control) -> Result<(), WorkerError> {
            if self.fail {
                return Err(WorkerError::Browser("button detached".into()));
            }
            self.activated.push(control.label.clone());
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn page() -> Document {
        Document::parse(
            r#"{"tag": "body", "children": [
                {"tag": "div", "attrs": {"data-id": "7"}, "children": [
                    {"tag": "button", "text": "Contact supplier"}
                ]}
            ]}"#,
        )
        .unwrap()
    }

    fn item(id: &str) -> FeedItem {
        FeedItem {
            id: id.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_claim_activates_located_control() {
        let mut ctx = Ctx {
            fail: false,
            activated: Vec::new(),
        };
        let result = Claimer::default().claim(&mut ctx, &page(), &item("7")).await;
        assert!(matches!(result, ClaimResult::Captured { .. }));
        assert_eq!(ctx.activated, vec!["Contact supplier"]);
    }

    #[tokio::test]
    async fn test_missing_control_and_failed_activation() {
        let mut ctx = Ctx {
            fail: true,
            activated: Vec::new(),
        };
        assert_eq!(
            Claimer::default().claim(&mut ctx, &page(), &item("8")).await,
            ClaimResult::Rejected {
                reason: RejectReason::ControlNotFound,
                error: None
            }
        );
        assert!(matches!(
            Claimer::default().claim(&mut ctx, &page(), &item("7")).await,
            ClaimResult::Rejected {
                reason: RejectReason::ClaimFailed,
                error: Some(_)
            }
        ));
    }
}
