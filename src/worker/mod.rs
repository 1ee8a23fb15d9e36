//! Capture worker.
//!
//! | module      | role                                               |
//! |-------------|----------------------------------------------------|
//! | `feed`      | fetching feed snapshots                            |
//! | `freshness` | item age from the feed's own timestamps            |
//! | `matching`  | exclusions, keywords, regions, contact rules       |
//! | `locator`   | page snapshots and claim control strategies        |
//! | `browser`   | browsing contexts                                  |
//! | `claim`     | locating and activating claim controls             |
//! | `verify`    | background verification on an isolated context     |
//! | `heartbeat` | periodic worker document                           |
//! | `limits`    | schedule, run limits and cooldown                  |
//!
//! One run is one process. The main loop cycles
//! `SCANNING → MATCHING → CLAIMING → VERIFYING` and parks in
//! `LOGIN_REQUIRED` while the feed reports an invalid session. Every
//! observed item ends up in the ledger exactly once per run.

pub mod browser;
pub mod claim;
pub mod feed;
pub mod freshness;
pub mod heartbeat;
pub mod limits;
pub mod locator;
pub mod matching;
pub mod verify;

use anyhow::Context;
use chrono::{DateTime, Utc};
use slotwarden_common::{
    DesiredCommand, LedgerEntry, Metrics, Phase, RejectReason, RunId, SlotConfig, SlotId,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clock::{Clock, SystemClock};
use crate::config::{Settings, WorkerSection};
use crate::errors::{StoreError, WorkerError};
use crate::ledger::Ledger;
use crate::store::SlotStore;
use browser::{Browser, BrowsingContext, SnapshotBrowser};
use claim::{ClaimResult, Claimer};
use feed::{CandidateFeed, FeedItem, Location, SourceFeed};
use heartbeat::HeartbeatPublisher;
use verify::{ClaimedItem, Verifier, VerifyBatch};

/// What the heartbeat publishes, shared between the loop and its tasks.
#[derive(Debug, Clone, Default)]
pub struct WorkerState {
    pub phase: Phase,
    pub metrics: Metrics,
    pub stop_reason: Option<String>,
}

pub type SharedState = Arc<Mutex<WorkerState>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { captured: usize },
    LoginRequired,
}

/// Worker pacing resolved from `[worker]`.
#[derive(Debug, Clone)]
pub struct Pacing {
    pub heartbeat_interval: Duration,
    pub scan_interval: Duration,
    pub max_cooldown: Duration,
    pub poll: Duration,
    pub teardown_timeout: Duration,
    pub verify_settle: Duration,
    pub http_timeout: Duration,
}

impl From<&WorkerSection> for Pacing {
    fn from(section: &WorkerSection) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(section.heartbeat_interval_ms.max(1)),
            scan_interval: Duration::from_millis(section.scan_interval_ms),
            max_cooldown: Duration::from_millis(section.max_cooldown_ms),
            poll: Duration::from_millis(section.session_poll_ms.max(1)),
            teardown_timeout: Duration::from_secs(section.teardown_timeout_secs),
            verify_settle: Duration::from_millis(section.verify_settle_ms),
            http_timeout: Duration::from_secs(section.http_timeout_secs.max(1)),
        }
    }
}

struct Candidate {
    item: FeedItem,
    age: Option<u64>,
}

/// The scan/match/claim loop of one run.
pub struct CaptureWorker {
    feed: Box<dyn CandidateFeed>,
    context: Box<dyn BrowsingContext>,
    claimer: Claimer,
    ledger: Arc<Mutex<Ledger>>,
    state: SharedState,
    verify_tx: mpsc::UnboundedSender<VerifyBatch>,
}

impl CaptureWorker {
    pub fn new(
        feed: Box<dyn CandidateFeed>,
        context: Box<dyn BrowsingContext>,
        ledger: Arc<Mutex<Ledger>>,
        state: SharedState,
        verify_tx: mpsc::UnboundedSender<VerifyBatch>,
    ) -> Self {
        Self {
            feed,
            context,
            claimer: Claimer::default(),
            ledger,
            state,
            verify_tx,
        }
    }

    async fn set_phase(&self, phase: Phase) {
        let mut state = self.state.lock().await;
        if state.phase != phase {
            tracing::debug!(from = %state.phase, to = %phase, "Phase change");
            state.phase = phase;
        }
    }

    async fn record_error(&self, message: impl Into<String>) {
        self.state.lock().await.metrics.record_error(message);
    }

    async fn reject(
        &self,
        item_id: &str,
        age: Option<u64>,
        reason: RejectReason,
    ) -> Result<(), WorkerError> {
        let recorded = {
            let mut ledger = self.ledger.lock().await;
            let entry = LedgerEntry::rejected(
                ledger.slot_id().clone(),
                ledger.run_id(),
                item_id,
                age,
                reason,
            );
            ledger.record(&entry)?
        };
        if recorded {
            self.state.lock().await.metrics.rejected_total += 1;
            tracing::debug!(item = %item_id, reason = reason.as_str(), "Rejected item");
        }
        Ok(())
    }

    async fn capture(&self, candidate: &Candidate) -> Result<bool, WorkerError> {
        let recorded = {
            let mut ledger = self.ledger.lock().await;
            let entry = LedgerEntry::captured(
                ledger.slot_id().clone(),
                ledger.run_id(),
                candidate.item.id.clone(),
                candidate.age,
            );
            ledger.record(&entry)?
        };
        if recorded {
            self.state.lock().await.metrics.claimed_total += 1;
        }
        Ok(recorded)
    }

    /// Run one scan/match/claim cycle with `config`.
    ///
    /// Per-item problems end up in the ledger; only store failures are
    /// returned as errors.
    pub async fn run_cycle(&mut self, config: &SlotConfig) -> Result<CycleOutcome, WorkerError> {
        self.set_phase(Phase::Scanning).await;
        let snapshot = self.feed.fetch().await;
        self.state.lock().await.metrics.pages_fetched += 1;
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Feed fetch failed");
                self.record_error(e.to_string()).await;
                return Ok(CycleOutcome::Completed { captured: 0 });
            }
        };
        if !snapshot.session_valid {
            return Ok(CycleOutcome::LoginRequired);
        }

        let mut seen = HashSet::new();
        let mut fresh = Vec::new();
        for item in snapshot.items {
            if item.id.trim().is_empty() || !seen.insert(item.id.clone()) {
                continue;
            }
            if self.ledger.lock().await.has_observed(&item.id) {
                continue;
            }
            self.state.lock().await.metrics.items_seen += 1;
            let age = freshness::item_age(&item, snapshot.generated_at);
            match freshness::check(age, config) {
                Ok(()) => fresh.push(Candidate { item, age }),
                Err(reason) => self.reject(&item.id, age, reason).await?,
            }
        }

        self.set_phase(Phase::Matching).await;
        let mut matched = Vec::new();
        for candidate in fresh {
            match matching::evaluate(&candidate.item, config) {
                Ok(()) => matched.push(candidate),
                Err(reason) => self.reject(&candidate.item.id, candidate.age, reason).await?,
            }
        }
        if matched.is_empty() {
            return Ok(CycleOutcome::Completed { captured: 0 });
        }

        self.set_phase(Phase::Claiming).await;
        let overflow = matched.split_off(matched.len().min(config.max_claims_per_cycle));
        for candidate in &overflow {
            self.reject(&candidate.item.id, candidate.age, RejectReason::CycleCapReached)
                .await?;
        }

        let page = match self.context.navigate(&config.source.page_url).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(error = %e, url = %config.source.page_url, "Failed to load claim page");
                self.record_error(e.to_string()).await;
                for candidate in &matched {
                    self.reject(&candidate.item.id, candidate.age, RejectReason::ClaimFailed)
                        .await?;
                }
                return Ok(CycleOutcome::Completed { captured: 0 });
            }
        };

        let mut claimed = Vec::new();
        for candidate in matched {
            let result = self
                .claimer
                .claim(self.context.as_mut(), &page, &candidate.item)
                .await;
            match result {
                ClaimResult::Captured { .. } => {
                    if self.capture(&candidate).await? {
                        claimed.push(ClaimedItem {
                            item_id: candidate.item.id,
                            age_seconds: candidate.age,
                            contact: candidate.item.contact,
                        });
                    }
                }
                ClaimResult::Rejected { reason, error } => {
                    if let Some(error) = error {
                        self.record_error(error).await;
                    }
                    self.reject(&candidate.item.id, candidate.age, reason).await?;
                }
            }
        }

        let captured = claimed.len();
        if !claimed.is_empty() {
            if config.source.confirmation_url.trim().is_empty() {
                tracing::debug!(captured, "No confirmation view configured; skipping verification");
            } else {
                self.set_phase(Phase::Verifying).await;
                let batch = VerifyBatch {
                    confirmation_url: config.source.confirmation_url.clone(),
                    items: claimed,
                };
                if self.verify_tx.send(batch).is_err() {
                    tracing::warn!("Verifier is gone; claims stay unverified");
                }
            }
        }
        Ok(CycleOutcome::Completed { captured })
    }

    /// Cycle until a stop condition, returning the stop reason. The reason
    /// is also kept in the shared state for the final heartbeat.
    pub async fn drive(
        &mut self,
        stop: &mut StopWatch,
        pacing: &Pacing,
        started_at: DateTime<Utc>,
    ) -> Result<String, WorkerError> {
        let reason = self.cycle_until_stop(stop, pacing, started_at).await?;
        self.state.lock().await.stop_reason = Some(reason.clone());
        Ok(reason)
    }

    async fn cycle_until_stop(
        &mut self,
        stop: &mut StopWatch,
        pacing: &Pacing,
        started_at: DateTime<Utc>,
    ) -> Result<String, WorkerError> {
        loop {
            if let Some(reason) = stop.check()? {
                return Ok(reason);
            }
            let config = stop.config().clone();
            let claimed_total = self.state.lock().await.metrics.claimed_total;
            if let Some(reason) =
                limits::check(&config.limits, started_at, Utc::now(), claimed_total)
            {
                tracing::info!(reason, claimed_total, "Run limit reached");
                return Ok(reason.to_string());
            }

            let outcome = tokio::select! {
                outcome = self.run_cycle(&config) => outcome?,
                reason = stop.until_stop(pacing.poll) => {
                    let reason = reason?;
                    tracing::info!(%reason, "Stop arrived mid-cycle; abandoning the cycle");
                    return Ok(reason);
                }
            };
            match outcome {
                CycleOutcome::LoginRequired => {
                    self.set_phase(Phase::LoginRequired).await;
                    tracing::warn!("Feed session is invalid; waiting for a refreshed session");
                    if let Some(reason) = stop
                        .wait_for_session(config.source.session_file.as_deref(), pacing.poll)
                        .await?
                    {
                        return Ok(reason);
                    }
                    tracing::info!("Session refreshed; resuming");
                }
                CycleOutcome::Completed { captured } => {
                    let error_rate = {
                        let mut state = self.state.lock().await;
                        // A handed-off batch keeps VERIFYING visible until the next scan.
                        if state.phase != Phase::Verifying {
                            state.phase = Phase::Scanning;
                        }
                        state.metrics.error_rate
                    };
                    let pause =
                        limits::cooldown(error_rate, pacing.scan_interval, pacing.max_cooldown);
                    tracing::debug!(captured, error_rate, pause_ms = pause.as_millis() as u64, "Cycle done");
                    if let Some(reason) = stop.pause(pause, pacing.poll).await? {
                        return Ok(reason);
                    }
                }
            }
        }
    }

    /// Close the primary context and release the verifier's sender.
    pub async fn finish(mut self) {
        self.context.close().await;
    }
}

/// Watches for the ways a run is told to stop: a new STOP/RESTART command
/// in the control document, or SIGTERM/SIGINT. Also tracks the latest slot
/// configuration.
pub struct StopWatch {
    store: SlotStore,
    slot: SlotId,
    baseline_seq: u64,
    config: SlotConfig,
    signal: watch::Receiver<bool>,
}

impl StopWatch {
    pub fn new(
        store: SlotStore,
        slot: SlotId,
        baseline_seq: u64,
        config: SlotConfig,
        signal: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            slot,
            baseline_seq,
            config,
            signal,
        }
    }

    pub fn config(&self) -> &SlotConfig {
        &self.config
    }

    /// Stop reason if one is pending. A malformed control document is
    /// ignored until it is rewritten; a vanished slot is fatal.
    pub fn check(&mut self) -> Result<Option<String>, WorkerError> {
        if *self.signal.borrow() {
            return Ok(Some("signal".into()));
        }
        let control = match self.store.read_control(&self.slot) {
            Ok(control) => control,
            Err(e @ StoreError::Corrupt { .. }) => {
                tracing::warn!(error = %e, "Ignoring malformed control document");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if control.config != self.config {
            tracing::info!("Slot configuration changed");
            self.config = control.config;
        }
        if control.command_seq > self.baseline_seq {
            match control.command {
                DesiredCommand::Stop => return Ok(Some("stop_requested".into())),
                DesiredCommand::Restart => return Ok(Some("restart_requested".into())),
                _ => {}
            }
        }
        Ok(None)
    }

    /// Sleep for `total`, checking for a stop every `poll`.
    pub async fn pause(
        &mut self,
        total: Duration,
        poll: Duration,
    ) -> Result<Option<String>, WorkerError> {
        // An unrepresentable deadline means pausing until a stop.
        let deadline = Instant::now().checked_add(total);
        loop {
            if let Some(reason) = self.check()? {
                return Ok(Some(reason));
            }
            let step = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };
            self.wait_step(step).await;
        }
    }

    /// Resolve once a stop is pending, checking every `poll`. Used to race
    /// a cycle whose awaits may outlast the stop timeout.
    pub async fn until_stop(&mut self, poll: Duration) -> Result<String, WorkerError> {
        loop {
            if let Some(reason) = self.check()? {
                return Ok(reason);
            }
            self.wait_step(poll).await;
        }
    }

    async fn wait_step(&mut self, step: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            changed = self.signal.changed() => {
                if changed.is_err() {
                    tokio::time::sleep(step).await;
                }
            }
        }
    }

    /// Block until the session file's modification time changes or a stop
    /// arrives. Without a session file only a stop ends the wait.
    pub async fn wait_for_session(
        &mut self,
        session_file: Option<&str>,
        poll: Duration,
    ) -> Result<Option<String>, WorkerError> {
        if session_file.is_none() {
            tracing::warn!("No session file configured; only a stop ends the wait");
        }
        let path = session_file.map(Path::new);
        let baseline = path.and_then(modified);
        loop {
            if let Some(reason) = self.pause(poll, poll).await? {
                return Ok(Some(reason));
            }
            if let Some(path) = path
                && modified(path) != baseline
            {
                return Ok(None);
            }
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Flip a watch channel to `true` on SIGTERM or Ctrl-C.
fn listen_for_signals() -> (watch::Receiver<bool>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        match crate::supervisor::wait_for_shutdown_signal().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                let _ = tx.send(true);
            }
            Err(e) => tracing::warn!(error = %e, "Signal handlers unavailable"),
        }
        // Receivers must never see a closed channel.
        std::future::pending::<()>().await;
    });
    (rx, task)
}

/// Startup checks that make a run pointless.
pub fn require_runnable(config: &SlotConfig) -> Result<(), WorkerError> {
    if config.source.feed_url.trim().is_empty() {
        return Err(WorkerError::InvalidConfig("source.feed_url is not set".into()));
    }
    if config.source.page_url.trim().is_empty() {
        return Err(WorkerError::InvalidConfig("source.page_url is not set".into()));
    }
    Ok(())
}

/// Run one capture worker to completion.
pub async fn run_worker(settings: &Settings, slot: SlotId, run_id: RunId) -> anyhow::Result<()> {
    let store = SlotStore::new(&settings.root);
    let pacing = Pacing::from(&settings.toml.worker);

    let control = store
        .read_control(&slot)
        .with_context(|| format!("Failed to load slot {}", slot))?;
    let config = control.config.clone();
    require_runnable(&config)?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    if let Some(schedule) = &config.limits.schedule {
        for warning in limits::validate_schedule(schedule) {
            tracing::warn!("{}", warning);
        }
    }
    let location = Location::parse(&config.source.feed_url)?;

    let state: SharedState = Arc::new(Mutex::new(WorkerState::default()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut heartbeat =
        HeartbeatPublisher::new(store.clone(), slot.clone(), run_id, state.clone(), clock);
    heartbeat
        .publish()
        .await
        .context("Failed to publish initial heartbeat")?;
    let started_at = heartbeat.started_at();
    let (heartbeat_stop, heartbeat_rx) = watch::channel(false);
    let heartbeat_task = heartbeat.spawn(pacing.heartbeat_interval, heartbeat_rx);

    tracing::info!(%slot, run_id = %run_id.short(), pid = std::process::id(), "Worker started");

    let ledger = Ledger::open(store.ledger_path(&slot), slot.clone(), run_id)?;
    let ledger = Arc::new(Mutex::new(ledger));

    let client = feed::http_client(pacing.http_timeout)?;
    let browser: Arc<dyn Browser> = Arc::new(SnapshotBrowser::new(client.clone()));
    let context = browser.new_context().await?;

    let (verify_tx, verify_rx) = mpsc::unbounded_channel();
    let mut verifier = Verifier::new(
        browser.clone(),
        ledger.clone(),
        state.clone(),
        pacing.verify_settle,
    )
    .spawn(verify_rx);

    let (signal_rx, signal_task) = listen_for_signals();
    let mut stop = StopWatch::new(
        store.clone(),
        slot.clone(),
        control.command_seq,
        config,
        signal_rx,
    );

    let mut worker = CaptureWorker::new(
        Box::new(SourceFeed::new(location, client)),
        context,
        ledger,
        state.clone(),
        verify_tx,
    );
    let reason = match worker.drive(&mut stop, &pacing, started_at).await {
        Ok(reason) => reason,
        Err(e) => {
            signal_task.abort();
            verifier.abort();
            return Err(e).context("Worker run failed");
        }
    };
    tracing::info!(%reason, "Stopping worker");

    worker.finish().await;
    if tokio::time::timeout(pacing.teardown_timeout, &mut verifier)
        .await
        .is_err()
    {
        tracing::warn!("Verification still in flight at teardown; abandoning it");
        verifier.abort();
    }
    signal_task.abort();

    let _ = heartbeat_stop.send(true);
    let mut heartbeat = heartbeat_task
        .await
        .context("Heartbeat task panicked")?;
    state.lock().await.phase = Phase::Stopped;
    let last = heartbeat
        .publish()
        .await
        .context("Failed to publish final heartbeat")?;
    tracing::info!(
        claimed = last.metrics.claimed_total,
        verified = last.metrics.verified_total,
        rejected = last.metrics.rejected_total,
        "Worker stopped"
    );
    Ok(())
}
