use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::slot::{RunId, SlotId};

/// What happened to an observed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Captured,
    Rejected,
    Verified,
}

/// Ledger entries are deduplicated per item within a class: an item is
/// observed once (captured or rejected) and verified at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeClass {
    Observation,
    Verification,
}

impl Outcome {
    pub fn class(self) -> OutcomeClass {
        match self {
            Outcome::Captured | Outcome::Rejected => OutcomeClass::Observation,
            Outcome::Verified => OutcomeClass::Verification,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Captured => write!(f, "captured"),
            Outcome::Rejected => write!(f, "rejected"),
            Outcome::Verified => write!(f, "verified"),
        }
    }
}

/// Why an item was not captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Stale,
    UnknownAge,
    ExcludedTerm,
    KeywordMiss,
    RegionMismatch,
    ContactMissing,
    ContactMissingEmail,
    ContactMissingPhone,
    ContactUnverified,
    ControlNotFound,
    ClaimFailed,
    CycleCapReached,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Stale => "stale",
            RejectReason::UnknownAge => "unknown_age",
            RejectReason::ExcludedTerm => "excluded_term",
            RejectReason::KeywordMiss => "keyword_miss",
            RejectReason::RegionMismatch => "region_mismatch",
            RejectReason::ContactMissing => "contact_missing",
            RejectReason::ContactMissingEmail => "contact_missing_email",
            RejectReason::ContactMissingPhone => "contact_missing_phone",
            RejectReason::ContactUnverified => "contact_unverified",
            RejectReason::ControlNotFound => "control_not_found",
            RejectReason::ClaimFailed => "claim_failed",
            RejectReason::CycleCapReached => "cycle_cap_reached",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of a slot's ledger.
///
/// Construct through [`LedgerEntry::captured`], [`LedgerEntry::rejected`] or
/// [`LedgerEntry::verified`] so that `reason` is present exactly when the
/// outcome is `rejected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub slot_id: SlotId,
    pub run_id: RunId,
    pub item_id: String,
    pub age_seconds: Option<u64>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn captured(
        slot_id: SlotId,
        run_id: RunId,
        item_id: impl Into<String>,
        age_seconds: Option<u64>,
    ) -> Self {
        Self::build(slot_id, run_id, item_id, age_seconds, Outcome::Captured, None)
    }

    pub fn rejected(
        slot_id: SlotId,
        run_id: RunId,
        item_id: impl Into<String>,
        age_seconds: Option<u64>,
        reason: RejectReason,
    ) -> Self {
        Self::build(
            slot_id,
            run_id,
            item_id,
            age_seconds,
            Outcome::Rejected,
            Some(reason),
        )
    }

    pub fn verified(
        slot_id: SlotId,
        run_id: RunId,
        item_id: impl Into<String>,
        age_seconds: Option<u64>,
    ) -> Self {
        Self::build(slot_id, run_id, item_id, age_seconds, Outcome::Verified, None)
    }

    fn build(
        slot_id: SlotId,
        run_id: RunId,
        item_id: impl Into<String>,
        age_seconds: Option<u64>,
        outcome: Outcome,
        reason: Option<RejectReason>,
    ) -> Self {
        Self {
            slot_id,
            run_id,
            item_id: item_id.into(),
            age_seconds,
            outcome,
            reason,
            timestamp: Utc::now(),
        }
    }

    /// A rejected entry must carry a reason and other outcomes must not.
    pub fn is_well_formed(&self) -> bool {
        (self.outcome == Outcome::Rejected) == self.reason.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> SlotId {
        SlotId::new("slot_001").unwrap()
    }

    #[test]
    fn rejected_entries_carry_reason() {
        let entry = LedgerEntry::rejected(slot(), RunId::new(), "42", Some(31), RejectReason::Stale);
        assert!(entry.is_well_formed());
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["reason"], "stale");
        assert_eq!(json["age_seconds"], 31);
    }

    #[test]
    fn captured_entries_omit_reason() {
        let entry = LedgerEntry::captured(slot(), RunId::new(), "42", Some(3));
        assert!(entry.is_well_formed());
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn verification_is_its_own_class() {
        assert_eq!(Outcome::Captured.class(), OutcomeClass::Observation);
        assert_eq!(Outcome::Rejected.class(), OutcomeClass::Observation);
        assert_eq!(Outcome::Verified.class(), OutcomeClass::Verification);
    }
}
