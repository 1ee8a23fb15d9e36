//! Control-plane commands: provisioning, commands, configuration, status
//! and the ledger.

use anyhow::{Context, Result};
use chrono::Utc;
use console::style;
use slotwarden::config::Settings;
use slotwarden::ledger;
use slotwarden::store::SlotStore;
use slotwarden::supervisor::logcapture;
use slotwarden_common::{
    DesiredCommand, LedgerEntry, Outcome, RunId, SlotConfig, SlotId, SlotRecord, SlotStatus,
};
use std::path::Path;

use super::super::LedgerCommands;

const LOG_TAIL_LINES: usize = 10;

fn parse_slot(raw: &str) -> Result<SlotId> {
    raw.parse()
        .with_context(|| format!("Invalid slot id '{}'", raw))
}

/// Load a slot configuration from a `.toml` file, or JSON otherwise.
pub fn load_slot_config(path: &Path) -> Result<SlotConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read slot config: {}", path.display()))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse slot config: {}", path.display()))
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse slot config: {}", path.display()))
    }
}

fn print_warnings(config: &SlotConfig) {
    for warning in config.validate() {
        println!("  {} {}", style("warning:").yellow(), warning);
    }
}

pub fn cmd_provision(settings: &Settings, slot: &str, config: Option<&Path>) -> Result<()> {
    let slot = parse_slot(slot)?;
    let config = match config {
        Some(path) => load_slot_config(path)?,
        None => SlotConfig::default(),
    };
    let store = SlotStore::new(&settings.root);
    store.provision(&slot, config.clone())?;

    println!("Provisioned slot {}", style(&slot).cyan());
    print_warnings(&config);
    Ok(())
}

pub fn cmd_command(settings: &Settings, slot: &str, command: DesiredCommand) -> Result<()> {
    if command == DesiredCommand::None {
        anyhow::bail!("Nothing to issue: use start, stop or restart");
    }
    let slot = parse_slot(slot)?;
    let store = SlotStore::new(&settings.root);
    let control = store.update_control(&slot, |c| c.issue(command, Utc::now()))?;

    println!(
        "Issued {} to slot {} (seq {})",
        style(command).bold(),
        style(&slot).cyan(),
        control.command_seq
    );
    Ok(())
}

pub fn cmd_configure(settings: &Settings, slot: &str, config: &Path) -> Result<()> {
    let slot = parse_slot(slot)?;
    let config = load_slot_config(config)?;
    let store = SlotStore::new(&settings.root);
    store.update_control(&slot, |c| c.config = config.clone())?;

    println!(
        "Updated configuration of slot {}; a running worker picks it up on its next cycle",
        style(&slot).cyan()
    );
    print_warnings(&config);
    Ok(())
}

fn styled_status(status: SlotStatus) -> console::StyledObject<String> {
    let text = format!("{:<9}", status.to_string());
    match status {
        SlotStatus::Running => style(text).green(),
        SlotStatus::Starting | SlotStatus::Stopping => style(text).yellow(),
        SlotStatus::Error => style(text).red().bold(),
        SlotStatus::Stopped => style(text).dim(),
    }
}

fn print_record(record: &SlotRecord) {
    let heartbeat = record
        .last_heartbeat
        .map(|t| {
            let ago = (Utc::now() - t).num_seconds().max(0);
            format!("{}s ago", ago)
        })
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<20} {} {:<16} {:<8} {:<10} {:>7} {:>8}",
        record.slot_id.as_str(),
        styled_status(record.status),
        record.phase.to_string(),
        record
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into()),
        heartbeat,
        record.metrics.claimed_total,
        record.metrics.verified_total,
    );
    if let Some(error) = &record.last_error {
        println!("    {} {}", style("last error:").red(), error);
    }
    if let Some(reason) = &record.stop_reason
        && record.status == SlotStatus::Stopped
    {
        println!("    {} {}", style("stop reason:").dim(), reason);
    }
}

pub fn cmd_status(settings: &Settings, slot: Option<&str>, json: bool) -> Result<()> {
    let store = SlotStore::new(&settings.root);
    let slots = match slot {
        Some(raw) => vec![parse_slot(raw)?],
        None => store.list_slots()?,
    };
    let records = slots
        .iter()
        .map(|s| store.record(s))
        .collect::<Result<Vec<_>, _>>()?;

    if json {
        let out = if slot.is_some() && records.len() == 1 {
            serde_json::to_string_pretty(&records[0])?
        } else {
            serde_json::to_string_pretty(&records)?
        };
        println!("{}", out);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!(
            "No slots under {}. Run 'slotwarden provision <slot>' to create one.",
            settings.root.display()
        );
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<20} {:<9} {:<16} {:<8} {:<10} {:>7} {:>8}",
        "Slot", "Status", "Phase", "PID", "Heartbeat", "Claimed", "Verified"
    );
    println!(
        "{:<20} {:<9} {:<16} {:<8} {:<10} {:>7} {:>8}",
        "----", "------", "-----", "---", "---------", "-------", "--------"
    );
    for record in &records {
        print_record(record);
    }
    println!();

    if let [record] = records.as_slice()
        && slot.is_some()
    {
        let lines = logcapture::tail(&store.worker_log_path(&record.slot_id), LOG_TAIL_LINES)?;
        if !lines.is_empty() {
            println!("{}", style("Recent worker log:").bold());
            for line in lines {
                println!("  {}", line);
            }
            println!();
        }
    }
    Ok(())
}

fn print_entry(entry: &LedgerEntry) {
    let text = format!("{:<9}", entry.outcome.to_string());
    let outcome = match entry.outcome {
        Outcome::Captured => style(text).green(),
        Outcome::Verified => style(text).cyan(),
        Outcome::Rejected => style(text).dim(),
    };
    println!(
        "{}  {}  {:<24} {} {:>6} {}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.run_id.short(),
        entry.item_id,
        outcome,
        entry
            .age_seconds
            .map(|a| format!("{}s", a))
            .unwrap_or_else(|| "?".into()),
        entry.reason.map(|r| r.as_str()).unwrap_or(""),
    );
}

pub fn cmd_ledger(settings: &Settings, command: &LedgerCommands) -> Result<()> {
    let store = SlotStore::new(&settings.root);
    match command {
        LedgerCommands::Show { slot, run } => {
            let slot = parse_slot(slot)?;
            if !store.exists(&slot) {
                anyhow::bail!("Slot {} is not provisioned", slot);
            }
            let run = run.as_deref().map(parse_run).transpose()?;
            let entries = ledger::read_entries(&store.ledger_path(&slot), run)?;
            if entries.is_empty() {
                println!("No ledger entries for slot {}", slot);
                return Ok(());
            }
            for entry in &entries {
                print_entry(entry);
            }
            let rejected = entries
                .iter()
                .filter(|e| e.outcome == Outcome::Rejected)
                .count();
            println!();
            println!("{} entries, {} rejected", entries.len(), rejected);
        }
        LedgerCommands::Export { slot, output, run } => {
            let slot = parse_slot(slot)?;
            if !store.exists(&slot) {
                anyhow::bail!("Slot {} is not provisioned", slot);
            }
            let run = run.as_deref().map(parse_run).transpose()?;
            let count = ledger::export(&store.ledger_path(&slot), output, run)?;
            println!("Exported {} entries to {}", count, output.display());
        }
    }
    Ok(())
}

fn parse_run(raw: &str) -> Result<RunId> {
    raw.parse()
        .with_context(|| format!("Invalid run id '{}'", raw))
}
