//! Slot supervisor.
//!
//! | module       | role                                             |
//! |--------------|--------------------------------------------------|
//! | `reconcile`  | per-slot state machine driven by ticks           |
//! | `process`    | launching, polling and signalling workers        |
//! | `recovery`   | backoff and attempt cap for failed slots         |
//! | `logcapture` | per-slot worker log files                        |
//!
//! Only one supervisor may own a root at a time. Stopping the supervisor
//! leaves workers running; the next supervisor adopts them.

pub mod logcapture;
pub mod process;
pub mod reconcile;
pub mod recovery;

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

use crate::clock::SystemClock;
use crate::config::Settings;
use crate::errors::SupervisorError;
use crate::store::SlotStore;
use process::CommandLauncher;
use reconcile::{Reconciler, Timing};
use recovery::RecoveryPolicy;

pub use process::{LaunchSpec, ProcessState, WorkerLauncher, WorkerProcess};
pub use reconcile::ObservedIntent;

/// Exclusive lock on `<root>/supervisor.lock`, held for the supervisor's lifetime.
#[derive(Debug)]
pub struct RootLock {
    _file: File,
}

impl RootLock {
    pub fn acquire(path: &Path) -> Result<Self, SupervisorError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| anyhow::anyhow!(e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;
        file.try_lock_exclusive()
            .map_err(|_| SupervisorError::AlreadyRunning(path.to_path_buf()))?;
        Ok(Self { _file: file })
    }
}

/// Build a reconciler for `settings` that launches real worker processes.
pub fn build_reconciler(settings: &Settings) -> Result<Reconciler> {
    let program = settings.worker_program()?;
    tracing::debug!(program = %program.display(), "Worker program");
    Ok(Reconciler::new(
        SlotStore::new(&settings.root),
        Box::new(CommandLauncher::new(program)),
        Arc::new(SystemClock),
        Timing::from(&settings.toml.supervisor),
        RecoveryPolicy::from(&settings.toml.recovery),
    ))
}

/// Run the reconciliation loop until Ctrl-C or SIGTERM. With `once`, run a
/// single pass and return.
pub async fn run(settings: &Settings, once: bool) -> Result<()> {
    let _lock = RootLock::acquire(&settings.lock_file())?;
    let mut reconciler = build_reconciler(settings)?;

    if once {
        reconciler.tick();
        return Ok(());
    }

    tracing::info!(
        root = %settings.root.display(),
        tick_ms = settings.toml.supervisor.tick_ms,
        "Supervisor started"
    );

    let mut interval = tokio::time::interval(settings.tick());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => reconciler.tick(),
            result = &mut shutdown => {
                result?;
                break;
            }
        }
    }

    tracing::info!(
        workers = reconciler.tracked_count(),
        "Supervisor stopping; running workers are left for the next supervisor"
    );
    Ok(())
}

pub(crate) async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("SIGTERM handler failed")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Ctrl+C handler failed")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_lock_on_same_root_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("supervisor.lock");
        let _first = RootLock::acquire(&path).unwrap();
        let second = RootLock::acquire(&path);
        assert!(matches!(second, Err(SupervisorError::AlreadyRunning(_))));
    }

    #[test]
    fn test_lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("supervisor.lock");
        drop(RootLock::acquire(&path).unwrap());
        assert!(RootLock::acquire(&path).is_ok());
    }
}
