//! Long-running processes: `slotwarden supervise` and `slotwarden worker`.

use anyhow::{Context, Result};
use slotwarden::config::Settings;
use slotwarden_common::{RunId, SlotId};

pub async fn cmd_supervise(settings: &Settings, once: bool) -> Result<()> {
    for warning in settings.validate() {
        tracing::warn!("{}", warning);
    }
    std::fs::create_dir_all(&settings.root)
        .with_context(|| format!("Failed to create root {}", settings.root.display()))?;
    slotwarden::supervisor::run(settings, once).await
}

pub async fn cmd_worker(settings: &Settings, slot: &str, run_id: &str) -> Result<()> {
    let slot: SlotId = slot.parse().context("Invalid slot id")?;
    let run_id: RunId = run_id.parse().context("Invalid run id")?;
    slotwarden::worker::run_worker(settings, slot, run_id).await
}
