//! Shared domain types for slotwarden.
//!
//! The supervisor and the capture workers run as separate processes and only
//! meet through the per-slot documents on disk. Everything both sides need to
//! agree on lives here:
//! - `slot` — slot identity, desired commands, observed status, worker phase,
//!   slot configuration and the three per-slot documents
//! - `ledger` — ledger entries, outcomes and rejection reasons

pub mod ledger;
pub mod slot;

pub use ledger::{LedgerEntry, Outcome, OutcomeClass, RejectReason};
pub use slot::{
    ControlRecord, DesiredCommand, FailureKind, Metrics, Phase, RunId, RunLimits, Schedule,
    SlotConfig, SlotId, SlotIdError, SlotRecord, SlotStatus, SourceConfig, SupervisorRecord,
    WorkerRecord,
};
