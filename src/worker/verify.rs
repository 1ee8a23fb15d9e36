//! Post-claim verification.
//!
//! A single background task receives batches of claimed items, opens an
//! isolated browsing context per batch and looks for each item on the
//! confirmation view. The claim loop hands batches over and moves on.

use slotwarden_common::{LedgerEntry, OutcomeClass};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::SharedState;
use super::browser::Browser;
use super::feed::Contact;
use super::locator::Document;
use crate::errors::WorkerError;
use crate::ledger::Ledger;

/// An item the claim loop captured in this run.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedItem {
    pub item_id: String,
    pub age_seconds: Option<u64>,
    pub contact: Contact,
}

#[derive(Debug, Clone)]
pub struct VerifyBatch {
    pub confirmation_url: String,
    pub items: Vec<ClaimedItem>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub verified: usize,
    pub mismatched: usize,
}

pub struct Verifier {
    browser: Arc<dyn Browser>,
    ledger: Arc<Mutex<Ledger>>,
    state: SharedState,
    settle: Duration,
}

impl Verifier {
    pub fn new(
        browser: Arc<dyn Browser>,
        ledger: Arc<Mutex<Ledger>>,
        state: SharedState,
        settle: Duration,
    ) -> Self {
        Self {
            browser,
            ledger,
            state,
            settle,
        }
    }

    /// Verify batches one at a time until every sender is dropped.
    pub fn spawn(self, mut batches: mpsc::UnboundedReceiver<VerifyBatch>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                match self.verify(&batch).await {
                    Ok(report) => tracing::info!(
                        verified = report.verified,
                        mismatched = report.mismatched,
                        "Verification batch done"
                    ),
                    Err(e) => {
                        tracing::warn!(error = %e, items = batch.items.len(), "Verification batch failed");
                        self.state
                            .lock()
                            .await
                            .metrics
                            .record_error(format!("verify: {}", e));
                    }
                }
            }
        })
    }

    pub async fn verify(&self, batch: &VerifyBatch) -> Result<VerifyReport, WorkerError> {
        if batch.items.is_empty() {
            return Ok(VerifyReport::default());
        }
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        let mut context = self.browser.new_context().await?;
        let page = context.navigate(&batch.confirmation_url).await;
        context.close().await;
        let page = page?;

        let mut report = VerifyReport::default();
        for item in &batch.items {
            if is_confirmed(&page, item) {
                let recorded = {
                    let mut ledger = self.ledger.lock().await;
                    if ledger.contains(&item.item_id, OutcomeClass::Verification) {
                        false
                    } else {
                        let entry = LedgerEntry::verified(
                            ledger.slot_id().clone(),
                            ledger.run_id(),
                            item.item_id.clone(),
                            item.age_seconds,
                        );
                        ledger.record(&entry)?
                    }
                };
                if recorded {
                    self.state.lock().await.metrics.verified_total += 1;
                }
                report.verified += 1;
            } else {
                tracing::warn!(item = %item.item_id, "Claimed item missing from confirmation view");
                self.state.lock().await.metrics.verify_mismatches += 1;
                report.mismatched += 1;
            }
        }
        Ok(report)
    }
}

/// Whether the confirmation page shows the item, by id or by its contact.
pub fn is_confirmed(page: &Document, item: &ClaimedItem) -> bool {
    if page.mentions(&item.item_id) {
        return true;
    }

    let phone = item.contact.phone.as_deref().map(phone_key).unwrap_or_default();
    let email = item
        .contact
        .email
        .as_deref()
        .map(|e| e.trim().to_lowercase())
        .unwrap_or_default();
    if phone.is_empty() && email.is_empty() {
        return false;
    }

    page.ids().any(|id| {
        let node = page.node(id);
        std::iter::once(node.text.as_str())
            .chain(node.attrs.values().map(String::as_str))
            .any(|value| {
                (!email.is_empty() && value.to_lowercase().contains(&email))
                    || (!phone.is_empty() && digits(value).contains(&phone))
            })
    })
}

fn digits(s: &str) -> String {
    s.chars().filter(char::is_ascii_digit).collect()
}

/// Last ten digits of a phone number, ignoring formatting and country code.
fn phone_key(phone: &str) -> String {
    let d = digits(phone);
    d[d.len().saturating_sub(10)..].to_string()
}
