//! Per-slot state store.
//!
//! Each slot lives in its own directory under `<root>/slots/<slot_id>/` and
//! is described by three JSON documents with disjoint writers:
//!
//! | file              | writer        |
//! |-------------------|---------------|
//! | `control.json`    | control plane |
//! | `supervisor.json` | supervisor    |
//! | `worker.json`     | worker        |
//!
//! Every document is replaced atomically (write to a temp file in the same
//! directory, then rename), so a reader never sees a partial write. Readers
//! merge the three into a [`SlotRecord`].

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use slotwarden_common::{
    ControlRecord, SlotConfig, SlotId, SlotRecord, SupervisorRecord, WorkerRecord,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::StoreError;

pub const CONTROL_FILE: &str = "control.json";
pub const SUPERVISOR_FILE: &str = "supervisor.json";
pub const WORKER_FILE: &str = "worker.json";
pub const LEDGER_FILE: &str = "ledger.jsonl";
pub const WORKER_LOG_FILE: &str = "worker.log";

#[derive(Debug, Clone)]
pub struct SlotStore {
    root: PathBuf,
}

impl SlotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slots_dir(&self) -> PathBuf {
        self.root.join("slots")
    }

    pub fn slot_dir(&self, slot: &SlotId) -> PathBuf {
        self.slots_dir().join(slot.as_str())
    }

    pub fn control_path(&self, slot: &SlotId) -> PathBuf {
        self.slot_dir(slot).join(CONTROL_FILE)
    }

    pub fn supervisor_path(&self, slot: &SlotId) -> PathBuf {
        self.slot_dir(slot).join(SUPERVISOR_FILE)
    }

    pub fn worker_path(&self, slot: &SlotId) -> PathBuf {
        self.slot_dir(slot).join(WORKER_FILE)
    }

    pub fn ledger_path(&self, slot: &SlotId) -> PathBuf {
        self.slot_dir(slot).join(LEDGER_FILE)
    }

    pub fn log_dir(&self, slot: &SlotId) -> PathBuf {
        self.slot_dir(slot).join("logs")
    }

    pub fn worker_log_path(&self, slot: &SlotId) -> PathBuf {
        self.log_dir(slot).join(WORKER_LOG_FILE)
    }

    pub fn exists(&self, slot: &SlotId) -> bool {
        self.slot_dir(slot).is_dir()
    }

    /// All provisioned slots, sorted by id. Hidden directories and names that
    /// are not valid slot ids are skipped.
    pub fn list_slots(&self) -> Result<Vec<SlotId>, StoreError> {
        let dir = self.slots_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut slots: Vec<SlotId> = fs::read_dir(&dir)
            .map_err(|e| StoreError::io(&dir, e))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| !name.starts_with('.'))
            .filter_map(|name| SlotId::new(name).ok())
            .collect();

        slots.sort();
        Ok(slots)
    }

    /// Create a slot directory with its initial control and supervisor
    /// documents. Provisioning happens once; records persist across restarts.
    pub fn provision(&self, slot: &SlotId, config: SlotConfig) -> Result<(), StoreError> {
        let control_path = self.control_path(slot);
        if control_path.exists() {
            return Err(StoreError::AlreadyProvisioned(slot.clone()));
        }

        let log_dir = self.log_dir(slot);
        fs::create_dir_all(&log_dir).map_err(|e| StoreError::io(&log_dir, e))?;

        let control = ControlRecord {
            config,
            ..Default::default()
        };
        self.write_control(slot, &control)?;

        let supervisor = SupervisorRecord {
            updated_at: Some(Utc::now()),
            ..Default::default()
        };
        self.write_supervisor(slot, &supervisor)?;
        Ok(())
    }

    fn require(&self, slot: &SlotId) -> Result<(), StoreError> {
        if self.exists(slot) {
            Ok(())
        } else {
            Err(StoreError::SlotNotFound(slot.clone()))
        }
    }

    /// Read the control document. A provisioned slot without one has no
    /// command and default configuration.
    pub fn read_control(&self, slot: &SlotId) -> Result<ControlRecord, StoreError> {
        self.require(slot)?;
        Ok(read_json(&self.control_path(slot))?.unwrap_or_default())
    }

    pub fn write_control(&self, slot: &SlotId, control: &ControlRecord) -> Result<(), StoreError> {
        write_json_atomic(&self.control_path(slot), control)
    }

    /// Read-modify-write of the control document.
    pub fn update_control<F>(&self, slot: &SlotId, f: F) -> Result<ControlRecord, StoreError>
    where
        F: FnOnce(&mut ControlRecord),
    {
        let mut control = self.read_control(slot)?;
        f(&mut control);
        self.write_control(slot, &control)?;
        Ok(control)
    }

    pub fn read_supervisor(&self, slot: &SlotId) -> Result<SupervisorRecord, StoreError> {
        self.require(slot)?;
        Ok(read_json(&self.supervisor_path(slot))?.unwrap_or_default())
    }

    pub fn write_supervisor(
        &self,
        slot: &SlotId,
        record: &SupervisorRecord,
    ) -> Result<(), StoreError> {
        write_json_atomic(&self.supervisor_path(slot), record)
    }

    /// Read the worker document; `None` until a worker has reported.
    pub fn read_worker(&self, slot: &SlotId) -> Result<Option<WorkerRecord>, StoreError> {
        self.require(slot)?;
        read_json(&self.worker_path(slot))
    }

    pub fn write_worker(&self, slot: &SlotId, record: &WorkerRecord) -> Result<(), StoreError> {
        write_json_atomic(&self.worker_path(slot), record)
    }

    /// Merged view of all three documents. A malformed worker document is
    /// reported as if the worker had never written one.
    pub fn record(&self, slot: &SlotId) -> Result<SlotRecord, StoreError> {
        let control = self.read_control(slot)?;
        let supervisor = self.read_supervisor(slot)?;
        let worker = match self.read_worker(slot) {
            Ok(worker) => worker,
            Err(e) if e.is_corruption() => None,
            Err(e) => return Err(e),
        };
        Ok(SlotRecord::merge(
            slot.clone(),
            &control,
            &supervisor,
            worker.as_ref(),
        ))
    }
}

/// Read and parse a JSON document, `Ok(None)` if it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Serialize `value` and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &json)
}

/// Write `bytes` to a temp file next to `path`, then rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}
