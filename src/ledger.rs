//! Append-only per-slot ledger.
//!
//! One JSON object per line in `<slot>/ledger.jsonl`. Entries from every run
//! share the file and are told apart by `run_id`. Within a run an item is
//! observed (captured or rejected) at most once and verified at most once.

use slotwarden_common::{LedgerEntry, OutcomeClass, RunId, SlotId};
use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::errors::StoreError;

/// Ledger writer for a single run.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    slot_id: SlotId,
    run_id: RunId,
    recorded: HashSet<(String, OutcomeClass)>,
}

impl Ledger {
    /// Open the ledger for `run_id`, loading what that run already recorded
    /// so a restarted worker does not duplicate entries.
    pub fn open(path: PathBuf, slot_id: SlotId, run_id: RunId) -> Result<Self, StoreError> {
        let recorded = read_entries(&path, Some(run_id))?
            .into_iter()
            .map(|e| (e.item_id, e.outcome.class()))
            .collect();
        Ok(Self {
            path,
            slot_id,
            run_id,
            recorded,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slot_id(&self) -> &SlotId {
        &self.slot_id
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Whether the item already has a captured or rejected entry in this run.
    pub fn has_observed(&self, item_id: &str) -> bool {
        self.contains(item_id, OutcomeClass::Observation)
    }

    pub fn contains(&self, item_id: &str, class: OutcomeClass) -> bool {
        self.recorded.contains(&(item_id.to_string(), class))
    }

    /// Append `entry` unless its (item, outcome class) is already recorded.
    /// Returns whether a line was written.
    pub fn record(&mut self, entry: &LedgerEntry) -> Result<bool, StoreError> {
        let key = (entry.item_id.clone(), entry.outcome.class());
        if self.recorded.contains(&key) {
            tracing::debug!(item = %entry.item_id, outcome = %entry.outcome, "Ledger entry already recorded");
            return Ok(false);
        }

        let mut line = serde_json::to_string(entry).map_err(|source| StoreError::Serialize {
            path: self.path.clone(),
            source,
        })?;
        line.push('\n');

        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .map_err(|e| StoreError::io(&self.path, e))?;

        self.recorded.insert(key);
        Ok(true)
    }
}

/// Read entries, optionally only those of one run. Lines that do not parse
/// are skipped with a warning.
pub fn read_entries(path: &Path, run: Option<RunId>) -> Result<Vec<LedgerEntry>, StoreError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| StoreError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(&line) {
            Ok(entry) => {
                if run.is_none_or(|r| r == entry.run_id) {
                    entries.push(entry);
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), line = index + 1, error = %e, "Skipping malformed ledger line");
            }
        }
    }
    Ok(entries)
}

/// Copy ledger lines verbatim into `out`, optionally filtered by run.
/// Returns the number of lines written.
pub fn export(path: &Path, out: &Path, run: Option<RunId>) -> Result<usize, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let mut exported = String::new();
    let mut count = 0;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let keep = match run {
            None => true,
            Some(run) => serde_json::from_str::<LedgerEntry>(line)
                .map(|e| e.run_id == run)
                .unwrap_or(false),
        };
        if keep {
            exported.push_str(line);
            exported.push('\n');
            count += 1;
        }
    }

    crate::store::write_atomic(out, exported.as_bytes())?;
    Ok(count)
}
