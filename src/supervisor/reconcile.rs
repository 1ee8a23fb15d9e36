//! Per-slot reconciliation of desired command against observed process state.
//!
//! Each tick runs, for every slot:
//!
//! 1. load the three documents (a malformed control or supervisor document
//!    resets the slot to STOPPED)
//! 2. adopt a worker left behind by a previous supervisor
//! 3. reap the tracked process if it exited
//! 4. resolve intent: a pending explicit command first, otherwise the intent
//!    implied by the recorded status
//! 5. start a worker owed by RESTART once the previous one is gone
//! 6. grace, staleness, stop-timeout and retry checks
//! 7. persist the supervisor document if it changed
//!
//! The process table holds an entry from spawn until the exit is observed,
//! and nothing is spawned while a slot has an entry.

use chrono::{DateTime, TimeDelta, Utc};
use slotwarden_common::{
    ControlRecord, DesiredCommand, FailureKind, Phase, RunId, SlotId, SlotStatus,
    SupervisorRecord, WorkerRecord,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::process::{LaunchSpec, ProcessState, WorkerLauncher, WorkerProcess};
use super::recovery::{RecoveryDecision, RecoveryPolicy};
use crate::clock::{Clock, delta, elapsed};
use crate::config::SupervisorSection;
use crate::errors::{StoreError, SupervisorError};
use crate::store::SlotStore;

/// Bounded waits applied by the status checks.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub start_grace: Duration,
    pub stale_threshold: Duration,
    pub stop_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self::from(&SupervisorSection::default())
    }
}

impl From<&SupervisorSection> for Timing {
    fn from(section: &SupervisorSection) -> Self {
        Self {
            start_grace: Duration::from_secs(section.start_grace_secs),
            stale_threshold: Duration::from_secs(section.stale_threshold_secs),
            stop_timeout: Duration::from_secs(section.stop_timeout_secs),
        }
    }
}

/// What the recorded status implies when no process is tracked and no
/// command is pending, e.g. after a supervisor restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedIntent {
    /// STARTING with no process: the start was never completed, so start it.
    ImplicitStart,
    /// RUNNING with no process: the worker died while nobody was watching.
    ProcessLost,
    /// STOPPING with no process: the stop already happened.
    StopConfirmed,
}

impl ObservedIntent {
    pub fn from_status(status: SlotStatus) -> Option<Self> {
        match status {
            SlotStatus::Starting => Some(ObservedIntent::ImplicitStart),
            SlotStatus::Running => Some(ObservedIntent::ProcessLost),
            SlotStatus::Stopping => Some(ObservedIntent::StopConfirmed),
            SlotStatus::Stopped | SlotStatus::Error => None,
        }
    }
}

struct Tracked {
    process: Box<dyn WorkerProcess>,
    run_id: Option<RunId>,
}

pub struct Reconciler {
    store: SlotStore,
    launcher: Box<dyn WorkerLauncher>,
    clock: Arc<dyn Clock>,
    timing: Timing,
    policy: RecoveryPolicy,
    table: HashMap<SlotId, Tracked>,
}

impl Reconciler {
    pub fn new(
        store: SlotStore,
        launcher: Box<dyn WorkerLauncher>,
        clock: Arc<dyn Clock>,
        timing: Timing,
        policy: RecoveryPolicy,
    ) -> Self {
        Self {
            store,
            launcher,
            clock,
            timing,
            policy,
            table: HashMap::new(),
        }
    }

    pub fn store(&self) -> &SlotStore {
        &self.store
    }

    /// Pid of the process currently tracked for `slot`.
    pub fn tracked_pid(&self, slot: &SlotId) -> Option<u32> {
        self.table.get(slot).map(|t| t.process.pid())
    }

    pub fn tracked_count(&self) -> usize {
        self.table.len()
    }

    /// One pass over every provisioned slot. A failing slot is logged and
    /// skipped; it never stops the pass.
    pub fn tick(&mut self) {
        let slots = match self.store.list_slots() {
            Ok(slots) => slots,
            Err(e) => {
                error!(error = %e, "Failed to list slots");
                return;
            }
        };

        for slot in &slots {
            if let Err(e) = self.reconcile_slot(slot) {
                error!(slot = %slot, error = %e, "Reconciliation failed");
            }
        }

        self.reap_orphans(&slots);
    }

    /// Reconcile a single slot and return its resulting status.
    pub fn reconcile_slot(&mut self, slot: &SlotId) -> Result<SlotStatus, SupervisorError> {
        let now = self.clock.now();

        let control = match self.store.read_control(slot) {
            Ok(control) => control,
            Err(e) if e.is_corruption() => return self.reset_corrupt_slot(slot, None, e, now),
            Err(e) => return Err(e.into()),
        };
        let mut record = match self.store.read_supervisor(slot) {
            Ok(record) => record,
            Err(e) if e.is_corruption() => {
                return self.reset_corrupt_slot(slot, Some(&control), e, now);
            }
            Err(e) => return Err(e.into()),
        };
        let worker = match self.store.read_worker(slot) {
            Ok(worker) => worker,
            Err(e) if e.is_corruption() => {
                debug!(slot = %slot, error = %e, "Ignoring malformed worker document");
                None
            }
            Err(e) => return Err(e.into()),
        };
        let before = record.clone();

        self.adopt(slot, &record);
        self.reap(slot, &mut record, &control, worker.as_ref(), now);

        if let Some(command) = record.pending_command(&control) {
            record.acked_command_seq = control.command_seq;
            if command != DesiredCommand::None {
                info!(slot = %slot, %command, seq = control.command_seq, "Applying command");
                self.apply_command(slot, &mut record, &control, command, now);
            }
        } else if !self.table.contains_key(slot)
            && let Some(intent) = ObservedIntent::from_status(record.status)
        {
            self.apply_observed(slot, &mut record, &control, intent, now);
        }

        if record.pending_start && !self.table.contains_key(slot) {
            info!(slot = %slot, "Previous worker gone; starting pending run");
            self.spawn(slot, &mut record, &control, now);
        }

        self.check_status(slot, &mut record, &control, worker.as_ref(), now);

        if record != before {
            record.updated_at = Some(now);
            self.store.write_supervisor(slot, &record)?;
            if record.status != before.status {
                info!(slot = %slot, from = %before.status, to = %record.status, "Status changed");
            }
        }
        Ok(record.status)
    }

    fn adopt(&mut self, slot: &SlotId, record: &SupervisorRecord) {
        if self.table.contains_key(slot) || !record.status.expects_process() {
            return;
        }
        let Some(pid) = record.pid else {
            return;
        };
        if let Some(process) = self.launcher.adopt(pid) {
            info!(slot = %slot, pid, status = %record.status, "Adopted running worker");
            self.table.insert(
                slot.clone(),
                Tracked {
                    process,
                    run_id: record.run_id,
                },
            );
        }
    }

    fn reap(
        &mut self,
        slot: &SlotId,
        record: &mut SupervisorRecord,
        control: &ControlRecord,
        worker: Option<&WorkerRecord>,
        now: DateTime<Utc>,
    ) {
        let Some(tracked) = self.table.get_mut(slot) else {
            return;
        };
        let code = match tracked.process.try_exit() {
            Ok(ProcessState::Running) => return,
            Ok(ProcessState::Exited { code }) => code,
            Err(e) => {
                warn!(slot = %slot, pid = tracked.process.pid(), error = %e, "Failed to poll worker");
                return;
            }
        };
        let pid = tracked.process.pid();
        let run_id = tracked.run_id;
        self.table.remove(slot);

        // Adopted workers have no observable exit status; a worker that
        // published its STOPPED phase exited on purpose.
        let code = code.or_else(|| {
            worker
                .filter(|w| w.run_id.is_some() && w.run_id == run_id && w.phase == Phase::Stopped)
                .map(|_| 0)
        });
        info!(slot = %slot, pid, exit_code = ?code, "Worker exited");

        record.pid = None;
        record.last_exit_code = code;

        match record.status {
            SlotStatus::Stopping => {
                record.status = SlotStatus::Stopped;
                record.stop_requested_at = None;
                record.running_since = None;
            }
            SlotStatus::Starting | SlotStatus::Running if code == Some(0) => {
                info!(slot = %slot, "Worker stopped on its own");
                record.status = SlotStatus::Stopped;
                record.running_since = None;
            }
            SlotStatus::Starting | SlotStatus::Running => {
                let message = match code {
                    Some(code) => format!("worker exited with code {}", code),
                    None => "worker exited with unknown status".to_string(),
                };
                warn!(slot = %slot, pid, "{}", message);
                record.fail(SlotStatus::Error, FailureKind::Crashed, message);
                self.schedule_recovery(slot, record, control, FailureKind::Crashed, now);
            }
            SlotStatus::Stopped | SlotStatus::Error => {}
        }
    }

    fn apply_command(
        &mut self,
        slot: &SlotId,
        record: &mut SupervisorRecord,
        control: &ControlRecord,
        command: DesiredCommand,
        now: DateTime<Utc>,
    ) {
        let tracked = self.table.contains_key(slot);
        match command {
            DesiredCommand::None => {}
            DesiredCommand::Start => {
                record.recovery_attempts = 0;
                record.next_retry_at = None;
                record.failure = None;
                record.last_error = None;
                if !tracked {
                    self.spawn(slot, record, control, now);
                } else if matches!(record.status, SlotStatus::Starting | SlotStatus::Running) {
                    debug!(slot = %slot, "START ignored: worker already live");
                } else {
                    record.pending_start = true;
                }
            }
            DesiredCommand::Stop => {
                record.pending_start = false;
                record.next_retry_at = None;
                if tracked {
                    self.request_stop(slot, record, now);
                } else {
                    record.status = SlotStatus::Stopped;
                    record.pid = None;
                    record.stop_requested_at = None;
                    record.running_since = None;
                }
            }
            DesiredCommand::Restart => {
                record.recovery_attempts = 0;
                record.next_retry_at = None;
                record.failure = None;
                record.last_error = None;
                if tracked {
                    self.request_stop(slot, record, now);
                    record.pending_start = true;
                } else {
                    self.spawn(slot, record, control, now);
                }
            }
        }
    }

    fn apply_observed(
        &mut self,
        slot: &SlotId,
        record: &mut SupervisorRecord,
        control: &ControlRecord,
        intent: ObservedIntent,
        now: DateTime<Utc>,
    ) {
        debug!(slot = %slot, ?intent, "Resolving observed intent");
        match intent {
            ObservedIntent::ImplicitStart => {
                info!(slot = %slot, "Slot was STARTING with no worker; starting it");
                record.pid = None;
                self.spawn(slot, record, control, now);
            }
            ObservedIntent::ProcessLost => {
                record.pid = None;
                record.fail(
                    SlotStatus::Error,
                    FailureKind::Crashed,
                    "worker process disappeared",
                );
                warn!(slot = %slot, "RUNNING slot has no live worker");
                self.schedule_recovery(slot, record, control, FailureKind::Crashed, now);
            }
            ObservedIntent::StopConfirmed => {
                record.status = SlotStatus::Stopped;
                record.pid = None;
                record.stop_requested_at = None;
                record.running_since = None;
            }
        }
    }

    fn request_stop(&mut self, slot: &SlotId, record: &mut SupervisorRecord, now: DateTime<Utc>) {
        if record.status == SlotStatus::Stopping {
            return;
        }
        if let Some(tracked) = self.table.get_mut(slot)
            && let Err(e) = tracked.process.terminate()
        {
            warn!(slot = %slot, error = %e, "Failed to deliver SIGTERM");
        }
        record.status = SlotStatus::Stopping;
        record.stop_requested_at = Some(now);
        record.force_killed = false;
    }

    fn force_kill(&mut self, slot: &SlotId, record: &mut SupervisorRecord) {
        if let Some(tracked) = self.table.get_mut(slot) {
            if let Err(e) = tracked.process.kill() {
                warn!(slot = %slot, error = %e, "Failed to kill worker");
            }
            record.force_killed = true;
        }
    }

    fn spawn(
        &mut self,
        slot: &SlotId,
        record: &mut SupervisorRecord,
        control: &ControlRecord,
        now: DateTime<Utc>,
    ) {
        if self.table.contains_key(slot) {
            warn!(slot = %slot, "Refusing to spawn: a worker is still tracked");
            return;
        }

        let run_id = RunId::new();
        let spec = LaunchSpec {
            slot: slot.clone(),
            run_id,
            root: self.store.root().to_path_buf(),
            log_path: self.store.worker_log_path(slot),
        };
        record.pending_start = false;
        record.next_retry_at = None;

        match self.launcher.launch(&spec) {
            Ok(process) => {
                let pid = process.pid();
                info!(slot = %slot, pid, run_id = %run_id.short(), "Spawned worker");
                self.table.insert(
                    slot.clone(),
                    Tracked {
                        process,
                        run_id: Some(run_id),
                    },
                );
                record.status = SlotStatus::Starting;
                record.pid = Some(pid);
                record.run_id = Some(run_id);
                record.spawned_at = Some(now);
                record.running_since = None;
                record.stop_requested_at = None;
                record.force_killed = false;
            }
            Err(e) => {
                error!(slot = %slot, error = %e, "Spawn failed");
                record.pid = None;
                record.run_id = None;
                record.running_since = None;
                record.fail(SlotStatus::Error, FailureKind::SpawnFailure, e.to_string());
                self.schedule_recovery(slot, record, control, FailureKind::SpawnFailure, now);
            }
        }
    }

    fn schedule_recovery(
        &self,
        slot: &SlotId,
        record: &mut SupervisorRecord,
        control: &ControlRecord,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) {
        if let Some(since) = record.running_since
            && elapsed(now, since) >= self.policy.crash_window
        {
            debug!(slot = %slot, "Run outlived the crash window; resetting attempts");
            record.recovery_attempts = 0;
        }
        record.running_since = None;

        match self
            .policy
            .decide(kind, record.recovery_attempts, control.config.auto_recover)
        {
            RecoveryDecision::Retry { attempt, delay } => {
                info!(slot = %slot, attempt, delay_secs = delay.as_secs_f64(), failure = %kind, "Scheduling recovery");
                record.recovery_attempts = attempt;
                record.next_retry_at = Some(retry_at(now, delay));
            }
            RecoveryDecision::GiveUp { attempts } => {
                error!(slot = %slot, attempts, failure = %kind, "Recovery attempts exhausted; slot frozen in ERROR");
                record.next_retry_at = None;
                let reason = record.last_error.take().unwrap_or_else(|| kind.to_string());
                record.last_error = Some(format!(
                    "{} (gave up after {} recovery attempts)",
                    reason, attempts
                ));
            }
            RecoveryDecision::NotApplicable => {
                record.next_retry_at = None;
            }
        }
    }

    fn check_status(
        &mut self,
        slot: &SlotId,
        record: &mut SupervisorRecord,
        control: &ControlRecord,
        worker: Option<&WorkerRecord>,
        now: DateTime<Utc>,
    ) {
        let tracked = self.table.contains_key(slot);
        let heartbeat = worker.and_then(|w| w.heartbeat_for(record.run_id));

        match record.status {
            SlotStatus::Starting if tracked => {
                if heartbeat.is_some() {
                    info!(slot = %slot, pid = ?record.pid, "First heartbeat received");
                    record.status = SlotStatus::Running;
                    record.running_since = Some(now);
                } else {
                    let since = record.spawned_at.unwrap_or(now);
                    if elapsed(now, since) >= self.timing.start_grace {
                        warn!(slot = %slot, grace_secs = self.timing.start_grace.as_secs(), "No heartbeat within start grace; terminating");
                        self.force_kill(slot, record);
                        record.fail(
                            SlotStatus::Stopped,
                            FailureKind::StartTimeout,
                            format!(
                                "no heartbeat within {}s of spawn",
                                self.timing.start_grace.as_secs()
                            ),
                        );
                        record.pending_start = false;
                    }
                }
            }
            SlotStatus::Running if tracked => {
                let last = heartbeat
                    .or(record.running_since)
                    .or(record.spawned_at)
                    .unwrap_or(now);
                let age = elapsed(now, last);
                if age > self.timing.stale_threshold {
                    warn!(slot = %slot, age_secs = age.as_secs(), "Heartbeat stale; terminating worker");
                    self.force_kill(slot, record);
                    record.fail(
                        SlotStatus::Error,
                        FailureKind::HeartbeatTimeout,
                        format!("no heartbeat for {}s", age.as_secs()),
                    );
                    self.schedule_recovery(slot, record, control, FailureKind::HeartbeatTimeout, now);
                }
            }
            SlotStatus::Stopping if tracked && !record.force_killed => {
                let since = record.stop_requested_at.unwrap_or(now);
                if elapsed(now, since) >= self.timing.stop_timeout {
                    warn!(slot = %slot, timeout_secs = self.timing.stop_timeout.as_secs(), "Graceful stop timed out; killing worker");
                    self.force_kill(slot, record);
                }
            }
            SlotStatus::Error if !tracked => {
                if record.next_retry_at.is_some_and(|at| at <= now) {
                    info!(slot = %slot, attempt = record.recovery_attempts, "Recovery attempt");
                    self.spawn(slot, record, control, now);
                }
            }
            _ => {}
        }
    }

    /// Reset a slot whose control or supervisor document cannot be parsed.
    /// The control document is never rewritten; it belongs to the control plane.
    fn reset_corrupt_slot(
        &mut self,
        slot: &SlotId,
        control: Option<&ControlRecord>,
        err: StoreError,
        now: DateTime<Utc>,
    ) -> Result<SlotStatus, SupervisorError> {
        if let Some(tracked) = self.table.get_mut(slot) {
            warn!(slot = %slot, pid = tracked.process.pid(), "Killing worker of corrupted slot");
            if let Err(e) = tracked.process.kill() {
                warn!(slot = %slot, error = %e, "Failed to kill worker");
            }
        }

        let previous = self.store.read_supervisor(slot).ok();
        let acked_command_seq = match (control, &previous) {
            (Some(control), _) => control.command_seq,
            (None, Some(previous)) => previous.acked_command_seq,
            (None, None) => 0,
        };
        let mut record = SupervisorRecord {
            acked_command_seq,
            ..Default::default()
        };
        record.fail(
            SlotStatus::Stopped,
            FailureKind::StateStoreCorruption,
            err.to_string(),
        );

        let unchanged = previous.as_ref().is_some_and(|p| {
            let mut p = p.clone();
            p.updated_at = None;
            p == record
        });
        if !unchanged {
            error!(slot = %slot, error = %err, "State store corruption; slot reset to STOPPED");
            record.updated_at = Some(now);
            self.store.write_supervisor(slot, &record)?;
        }
        Ok(SlotStatus::Stopped)
    }

    /// Workers whose slot directory disappeared are stopped and forgotten
    /// once they exit.
    fn reap_orphans(&mut self, slots: &[SlotId]) {
        let orphans: Vec<SlotId> = self
            .table
            .keys()
            .filter(|slot| !slots.contains(slot))
            .cloned()
            .collect();
        for slot in orphans {
            let Some(tracked) = self.table.get_mut(&slot) else {
                continue;
            };
            match tracked.process.try_exit() {
                Ok(ProcessState::Running) => {
                    warn!(slot = %slot, "Slot removed while its worker runs; killing it");
                    if let Err(e) = tracked.process.kill() {
                        warn!(slot = %slot, error = %e, "Failed to kill orphaned worker");
                    }
                }
                Ok(ProcessState::Exited { .. }) | Err(_) => {
                    self.table.remove(&slot);
                }
            }
        }
    }
}

/// When a retry `delay` from `now` falls due. Delays beyond ten years are
/// clamped so the timestamp stays representable.
fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let horizon = TimeDelta::try_days(3650).unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(delta(delay).min(horizon))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use slotwarden_common::SlotConfig;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct FakeWorld {
        next_pid: u32,
        /// pid -> exit code once exited
        exited: HashMap<u32, Option<i32>>,
        alive: Vec<u32>,
        terminated: Vec<u32>,
        killed: Vec<u32>,
        launches: Vec<LaunchSpec>,
        fail_launch: bool,
        /// Exit with this code as soon as SIGTERM arrives.
        exit_on_term: Option<i32>,
        adoptable: Vec<u32>,
        max_alive_seen: usize,
    }

    impl FakeWorld {
        fn exit(&mut self, pid: u32, code: Option<i32>) {
            self.alive.retain(|p| *p != pid);
            self.exited.insert(pid, code);
        }
    }

    #[derive(Clone, Default)]
    struct FakeLauncher(Arc<Mutex<FakeWorld>>);

    struct FakeProcess {
        pid: u32,
        world: Arc<Mutex<FakeWorld>>,
    }

    impl WorkerProcess for FakeProcess {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn try_exit(&mut self) -> std::io::Result<ProcessState> {
            let world = self.world.lock().unwrap();
            Ok(match world.exited.get(&self.pid) {
                Some(code) => ProcessState::Exited { code: *code },
                None => ProcessState::Running,
            })
        }

        fn terminate(&mut self) -> Result<(), SupervisorError> {
            let mut world = self.world.lock().unwrap();
            world.terminated.push(self.pid);
            if let Some(code) = world.exit_on_term {
                world.exit(self.pid, Some(code));
            }
            Ok(())
        }

        fn kill(&mut self) -> Result<(), SupervisorError> {
            let mut world = self.world.lock().unwrap();
            world.killed.push(self.pid);
            world.exit(self.pid, Some(137));
            Ok(())
        }
    }

    impl WorkerLauncher for FakeLauncher {
        fn launch(&mut self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>, SupervisorError> {
            let mut world = self.0.lock().unwrap();
            world.launches.push(spec.clone());
            if world.fail_launch {
                return Err(SupervisorError::SpawnFailed {
                    slot: spec.slot.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such program"),
                });
            }
            world.next_pid += 1;
            let pid = 1000 + world.next_pid;
            world.alive.push(pid);
            world.max_alive_seen = world.max_alive_seen.max(world.alive.len());
            Ok(Box::new(FakeProcess {
                pid,
                world: self.0.clone(),
            }))
        }

        fn adopt(&mut self, pid: u32) -> Option<Box<dyn WorkerProcess>> {
            let world = self.0.lock().unwrap();
            world.adoptable.contains(&pid).then(|| {
                Box::new(FakeProcess {
                    pid,
                    world: self.0.clone(),
                }) as Box<dyn WorkerProcess>
            })
        }
    }

    struct Harness {
        _dir: TempDir,
        store: SlotStore,
        clock: Arc<ManualClock>,
        world: Arc<Mutex<FakeWorld>>,
        reconciler: Reconciler,
        slot: SlotId,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_policy(RecoveryPolicy::default())
        }

        fn with_policy(policy: RecoveryPolicy) -> Self {
            let dir = tempdir().unwrap();
            let store = SlotStore::new(dir.path());
            let slot = SlotId::new("slot_001").unwrap();
            store.provision(&slot, SlotConfig::default()).unwrap();
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let launcher = FakeLauncher::default();
            let world = launcher.0.clone();
            let reconciler = Reconciler::new(
                store.clone(),
                Box::new(launcher),
                clock.clone(),
                Timing::default(),
                policy,
            );
            Self {
                _dir: dir,
                store,
                clock,
                world,
                reconciler,
                slot,
            }
        }

        fn command(&self, command: DesiredCommand) {
            self.store
                .update_control(&self.slot, |c| c.issue(command, self.clock.now()))
                .unwrap();
        }

        fn tick(&mut self) -> SlotStatus {
            let slot = self.slot.clone();
            self.reconciler.reconcile_slot(&slot).unwrap()
        }

        fn advance(&self, secs: u64) {
            self.clock.advance(Duration::from_secs(secs));
        }

        fn record(&self) -> SupervisorRecord {
            self.store.read_supervisor(&self.slot).unwrap()
        }

        fn heartbeat(&self) {
            let run_id = self.record().run_id;
            self.store
                .write_worker(
                    &self.slot,
                    &WorkerRecord {
                        run_id,
                        last_heartbeat: Some(self.clock.now()),
                        phase: Phase::Scanning,
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        fn current_pid(&self) -> u32 {
            self.record().pid.unwrap()
        }

        fn start_running(&mut self) -> u32 {
            self.command(DesiredCommand::Start);
            assert_eq!(self.tick(), SlotStatus::Starting);
            self.heartbeat();
            assert_eq!(self.tick(), SlotStatus::Running);
            self.current_pid()
        }
    }

    #[test]
    fn test_none_command_is_acknowledged_without_effect() {
        let mut h = Harness::new();
        let pid = h.start_running();
        h.command(DesiredCommand::None);

        assert_eq!(h.tick(), SlotStatus::Running);
        let record = h.record();
        assert_eq!(record.acked_command_seq, 2);
        assert_eq!(record.pid, Some(pid));
        assert_eq!(h.world.lock().unwrap().launches.len(), 1);
        assert!(h.world.lock().unwrap().killed.is_empty());
    }

    #[test]
    fn test_start_spawns_once_and_records_run() {
        let mut h = Harness::new();
        h.command(DesiredCommand::Start);

        assert_eq!(h.tick(), SlotStatus::Starting);
        let record = h.record();
        assert!(record.pid.is_some());
        assert!(record.run_id.is_some());
        assert_eq!(record.acked_command_seq, 1);

        // The command is edge-triggered: more ticks do not spawn again.
        h.tick();
        h.tick();
        assert_eq!(h.world.lock().unwrap().launches.len(), 1);
    }

    #[test]
    fn test_launch_spec_points_at_slot_log() {
        let mut h = Harness::new();
        h.command(DesiredCommand::Start);
        h.tick();

        let world = h.world.lock().unwrap();
        let spec = &world.launches[0];
        assert_eq!(spec.slot, h.slot);
        assert_eq!(spec.log_path, h.store.worker_log_path(&h.slot));
        assert_eq!(Some(spec.run_id), h.record().run_id);
    }

    #[test]
    fn test_heartbeat_within_grace_moves_to_running() {
        let mut h = Harness::new();
        h.command(DesiredCommand::Start);
        h.tick();
        h.advance(14);
        h.heartbeat();

        assert_eq!(h.tick(), SlotStatus::Running);
        assert!(h.record().running_since.is_some());
    }

    #[test]
    fn test_heartbeat_from_previous_run_does_not_count() {
        let mut h = Harness::new();
        h.store
            .write_worker(
                &h.slot,
                &WorkerRecord {
                    run_id: Some(RunId::new()),
                    last_heartbeat: Some(h.clock.now()),
                    ..Default::default()
                },
            )
            .unwrap();
        h.command(DesiredCommand::Start);
        h.tick();

        assert_eq!(h.tick(), SlotStatus::Starting);
    }

    #[test]
    fn test_start_timeout_at_grace_boundary() {
        let mut h = Harness::new();
        h.command(DesiredCommand::Start);
        h.tick();
        let pid = h.current_pid();

        h.advance(14);
        assert_eq!(h.tick(), SlotStatus::Starting);
        h.advance(1);
        assert_eq!(h.tick(), SlotStatus::Stopped);

        let record = h.record();
        assert_eq!(record.failure, Some(FailureKind::StartTimeout));
        assert!(h.world.lock().unwrap().killed.contains(&pid));

        // The killed process is reaped on the next tick.
        h.tick();
        assert_eq!(h.reconciler.tracked_pid(&h.slot), None);
        assert_eq!(h.record().status, SlotStatus::Stopped);
    }

    #[test]
    fn test_stale_heartbeat_moves_to_error_and_kills() {
        let mut h = Harness::new();
        let pid = h.start_running();

        h.advance(20);
        assert_eq!(h.tick(), SlotStatus::Running);
        h.advance(1);
        assert_eq!(h.tick(), SlotStatus::Error);

        let record = h.record();
        assert_eq!(record.failure, Some(FailureKind::HeartbeatTimeout));
        assert!(h.world.lock().unwrap().killed.contains(&pid));
        // auto_recover is off by default
        assert!(record.next_retry_at.is_none());
    }

    #[test]
    fn test_fresh_heartbeats_keep_running() {
        let mut h = Harness::new();
        h.start_running();
        for _ in 0..10 {
            h.advance(5);
            h.heartbeat();
            assert_eq!(h.tick(), SlotStatus::Running);
        }
    }

    #[test]
    fn test_graceful_stop_confirms_after_exit() {
        let mut h = Harness::new();
        let pid = h.start_running();

        h.command(DesiredCommand::Stop);
        assert_eq!(h.tick(), SlotStatus::Stopping);
        assert!(h.world.lock().unwrap().terminated.contains(&pid));
        assert!(h.record().stop_requested_at.is_some());

        h.world.lock().unwrap().exit(pid, Some(0));
        assert_eq!(h.tick(), SlotStatus::Stopped);
        let record = h.record();
        assert_eq!(record.last_exit_code, Some(0));
        assert_eq!(record.pid, None);
        assert!(!record.force_killed);
    }

    #[test]
    fn test_unresponsive_worker_is_killed_after_stop_timeout() {
        let mut h = Harness::new();
        let pid = h.start_running();
        h.command(DesiredCommand::Stop);
        h.tick();

        h.advance(9);
        h.heartbeat();
        assert_eq!(h.tick(), SlotStatus::Stopping);
        assert!(h.world.lock().unwrap().killed.is_empty());

        h.advance(1);
        h.tick();
        assert!(h.world.lock().unwrap().killed.contains(&pid));
        assert!(h.record().force_killed);

        assert_eq!(h.tick(), SlotStatus::Stopped);
    }

    #[test]
    fn test_stop_without_process_is_immediate() {
        let mut h = Harness::new();
        h.command(DesiredCommand::Stop);
        assert_eq!(h.tick(), SlotStatus::Stopped);
        assert!(h.world.lock().unwrap().launches.is_empty());
    }

    #[test]
    fn test_restart_never_overlaps_processes() {
        let mut h = Harness::new();
        let first = h.start_running();

        h.command(DesiredCommand::Restart);
        assert_eq!(h.tick(), SlotStatus::Stopping);
        assert!(h.record().pending_start);
        // Still tearing down: no second process.
        h.tick();
        assert_eq!(h.world.lock().unwrap().launches.len(), 1);

        h.world.lock().unwrap().exit(first, Some(0));
        assert_eq!(h.tick(), SlotStatus::Starting);
        let second = h.current_pid();
        assert_ne!(first, second);

        let world = h.world.lock().unwrap();
        assert_eq!(world.launches.len(), 2);
        assert_eq!(world.max_alive_seen, 1);
    }

    #[test]
    fn test_restart_with_prompt_exit_respawns_same_tick() {
        let mut h = Harness::new();
        h.start_running();
        h.world.lock().unwrap().exit_on_term = Some(0);

        h.command(DesiredCommand::Restart);
        assert_eq!(h.tick(), SlotStatus::Stopping);
        assert_eq!(h.tick(), SlotStatus::Starting);
        assert_eq!(h.world.lock().unwrap().max_alive_seen, 1);
    }

    #[test]
    fn test_start_during_stop_waits_for_exit() {
        let mut h = Harness::new();
        let pid = h.start_running();
        h.command(DesiredCommand::Stop);
        h.tick();

        h.command(DesiredCommand::Start);
        assert_eq!(h.tick(), SlotStatus::Stopping);
        assert_eq!(h.world.lock().unwrap().launches.len(), 1);

        h.world.lock().unwrap().exit(pid, Some(0));
        assert_eq!(h.tick(), SlotStatus::Starting);
    }

    #[test]
    fn test_start_when_running_is_noop() {
        let mut h = Harness::new();
        h.start_running();
        h.command(DesiredCommand::Start);
        assert_eq!(h.tick(), SlotStatus::Running);
        assert_eq!(h.world.lock().unwrap().launches.len(), 1);
    }

    #[test]
    fn test_clean_self_exit_is_stopped() {
        let mut h = Harness::new();
        let pid = h.start_running();
        h.world.lock().unwrap().exit(pid, Some(0));

        assert_eq!(h.tick(), SlotStatus::Stopped);
        assert_eq!(h.record().failure, None);
    }

    #[test]
    fn test_crash_with_auto_recover_retries_with_backoff() {
        let mut h = Harness::with_policy(RecoveryPolicy {
            auto_recover: true,
            ..Default::default()
        });
        let pid = h.start_running();
        h.world.lock().unwrap().exit(pid, Some(1));

        assert_eq!(h.tick(), SlotStatus::Error);
        let record = h.record();
        assert_eq!(record.failure, Some(FailureKind::Crashed));
        assert_eq!(record.last_exit_code, Some(1));
        assert_eq!(record.recovery_attempts, 1);
        assert_eq!(
            record.next_retry_at,
            Some(h.clock.now() + chrono::TimeDelta::seconds(2))
        );

        h.advance(1);
        assert_eq!(h.tick(), SlotStatus::Error);
        h.advance(1);
        assert_eq!(h.tick(), SlotStatus::Starting);
        assert_eq!(h.world.lock().unwrap().launches.len(), 2);
    }

    #[test]
    fn test_huge_backoff_is_clamped() {
        let mut h = Harness::with_policy(RecoveryPolicy {
            auto_recover: true,
            base_delay: Duration::from_secs(u64::MAX),
            max_delay: Duration::from_secs(u64::MAX),
            ..Default::default()
        });
        let pid = h.start_running();
        h.world.lock().unwrap().exit(pid, Some(1));

        assert_eq!(h.tick(), SlotStatus::Error);
        assert_eq!(
            h.record().next_retry_at,
            Some(h.clock.now() + chrono::TimeDelta::days(3650))
        );
    }

    #[test]
    fn test_slot_override_disables_recovery() {
        let mut h = Harness::with_policy(RecoveryPolicy {
            auto_recover: true,
            ..Default::default()
        });
        h.store
            .update_control(&h.slot, |c| c.config.auto_recover = Some(false))
            .unwrap();
        let pid = h.start_running();
        h.world.lock().unwrap().exit(pid, Some(1));

        assert_eq!(h.tick(), SlotStatus::Error);
        assert!(h.record().next_retry_at.is_none());
    }

    #[test]
    fn test_spawn_failures_back_off_then_freeze() {
        let mut h = Harness::new();
        h.world.lock().unwrap().fail_launch = true;
        h.command(DesiredCommand::Start);

        assert_eq!(h.tick(), SlotStatus::Error);
        let mut delays = Vec::new();
        loop {
            let record = h.record();
            assert_eq!(record.failure, Some(FailureKind::SpawnFailure));
            let Some(at) = record.next_retry_at else {
                break;
            };
            let wait = (at - h.clock.now()).num_seconds();
            delays.push(wait);
            h.clock.set(at);
            assert_eq!(h.tick(), SlotStatus::Error);
        }

        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
        assert_eq!(h.world.lock().unwrap().launches.len(), 6);
        assert!(h.record().last_error.unwrap().contains("gave up"));

        // Frozen: time passing does nothing.
        h.advance(3600);
        h.tick();
        assert_eq!(h.world.lock().unwrap().launches.len(), 6);

        // A new START is the manual intervention.
        h.world.lock().unwrap().fail_launch = false;
        h.command(DesiredCommand::Start);
        assert_eq!(h.tick(), SlotStatus::Starting);
        assert_eq!(h.record().recovery_attempts, 0);
    }

    #[test]
    fn test_long_run_resets_attempts() {
        let mut h = Harness::with_policy(RecoveryPolicy {
            auto_recover: true,
            ..Default::default()
        });
        h.store
            .update_control(&h.slot, |c| c.config.auto_recover = Some(true))
            .unwrap();
        let pid = h.start_running();
        h.world.lock().unwrap().exit(pid, Some(1));
        h.tick();
        h.advance(2);
        assert_eq!(h.tick(), SlotStatus::Starting);
        h.heartbeat();
        assert_eq!(h.tick(), SlotStatus::Running);
        assert_eq!(h.record().recovery_attempts, 1);

        for _ in 0..13 {
            h.advance(5);
            h.heartbeat();
            h.tick();
        }
        let pid = h.current_pid();
        h.world.lock().unwrap().exit(pid, Some(1));
        h.tick();
        assert_eq!(h.record().recovery_attempts, 1);
    }

    #[test]
    fn test_corrupt_supervisor_document_resets_slot() {
        let mut h = Harness::new();
        let pid = h.start_running();
        fs::write(h.store.supervisor_path(&h.slot), "{\"status\": \"RUN").unwrap();

        assert_eq!(h.tick(), SlotStatus::Stopped);
        let record = h.record();
        assert_eq!(record.failure, Some(FailureKind::StateStoreCorruption));
        assert_eq!(record.acked_command_seq, 1);
        assert!(h.world.lock().unwrap().killed.contains(&pid));

        // The old START is not replayed and the killed process is reaped.
        assert_eq!(h.tick(), SlotStatus::Stopped);
        assert_eq!(h.reconciler.tracked_pid(&h.slot), None);
        assert_eq!(h.world.lock().unwrap().launches.len(), 1);
    }

    #[test]
    fn test_corrupt_control_document_is_left_untouched() {
        let mut h = Harness::new();
        let control_path = h.store.control_path(&h.slot);
        fs::write(&control_path, "not json").unwrap();

        assert_eq!(h.tick(), SlotStatus::Stopped);
        assert_eq!(fs::read_to_string(&control_path).unwrap(), "not json");
        assert_eq!(
            h.record().failure,
            Some(FailureKind::StateStoreCorruption)
        );
    }

    #[test]
    fn test_corrupt_slot_does_not_stop_other_slots() {
        let mut h = Harness::new();
        let other = SlotId::new("slot_002").unwrap();
        h.store.provision(&other, SlotConfig::default()).unwrap();
        h.store
            .update_control(&other, |c| c.issue(DesiredCommand::Start, h.clock.now()))
            .unwrap();
        fs::write(h.store.supervisor_path(&h.slot), "[").unwrap();

        h.reconciler.tick();

        assert_eq!(
            h.store.read_supervisor(&other).unwrap().status,
            SlotStatus::Starting
        );
        assert_eq!(h.record().status, SlotStatus::Stopped);
    }

    #[test]
    fn test_corrupt_worker_document_means_no_heartbeat() {
        let mut h = Harness::new();
        h.command(DesiredCommand::Start);
        h.tick();
        fs::write(h.store.worker_path(&h.slot), "{").unwrap();

        assert_eq!(h.tick(), SlotStatus::Starting);
    }

    #[test]
    fn test_live_worker_is_adopted_after_supervisor_restart() {
        let mut h = Harness::new();
        h.store
            .write_supervisor(
                &h.slot,
                &SupervisorRecord {
                    status: SlotStatus::Running,
                    pid: Some(4242),
                    run_id: Some(RunId::new()),
                    running_since: Some(h.clock.now()),
                    ..Default::default()
                },
            )
            .unwrap();
        h.world.lock().unwrap().adoptable.push(4242);
        h.heartbeat();

        assert_eq!(h.tick(), SlotStatus::Running);
        assert_eq!(h.reconciler.tracked_pid(&h.slot), Some(4242));
        assert!(h.world.lock().unwrap().launches.is_empty());
    }

    #[test]
    fn test_pending_stop_reaches_adopted_worker() {
        let mut h = Harness::new();
        h.store
            .write_supervisor(
                &h.slot,
                &SupervisorRecord {
                    status: SlotStatus::Running,
                    pid: Some(4242),
                    run_id: Some(RunId::new()),
                    ..Default::default()
                },
            )
            .unwrap();
        h.world.lock().unwrap().adoptable.push(4242);
        h.command(DesiredCommand::Stop);

        assert_eq!(h.tick(), SlotStatus::Stopping);
        assert!(h.world.lock().unwrap().terminated.contains(&4242));
    }

    #[test]
    fn test_adopted_worker_that_published_stopped_exits_cleanly() {
        let mut h = Harness::new();
        let run_id = RunId::new();
        h.store
            .write_supervisor(
                &h.slot,
                &SupervisorRecord {
                    status: SlotStatus::Running,
                    pid: Some(4242),
                    run_id: Some(run_id),
                    ..Default::default()
                },
            )
            .unwrap();
        h.world.lock().unwrap().adoptable.push(4242);
        h.heartbeat();
        h.tick();

        h.store
            .write_worker(
                &h.slot,
                &WorkerRecord {
                    run_id: Some(run_id),
                    last_heartbeat: Some(h.clock.now()),
                    phase: Phase::Stopped,
                    ..Default::default()
                },
            )
            .unwrap();
        h.world.lock().unwrap().exit(4242, None);

        assert_eq!(h.tick(), SlotStatus::Stopped);
        assert_eq!(h.record().last_exit_code, Some(0));
    }

    #[test]
    fn test_starting_slot_without_process_is_started() {
        let mut h = Harness::new();
        h.store
            .write_supervisor(
                &h.slot,
                &SupervisorRecord {
                    status: SlotStatus::Starting,
                    pid: Some(9999),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(h.tick(), SlotStatus::Starting);
        assert_eq!(h.world.lock().unwrap().launches.len(), 1);
        assert_ne!(h.record().pid, Some(9999));
    }

    #[test]
    fn test_running_slot_without_process_is_a_crash() {
        let mut h = Harness::new();
        h.store
            .write_supervisor(
                &h.slot,
                &SupervisorRecord {
                    status: SlotStatus::Running,
                    pid: Some(9999),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(h.tick(), SlotStatus::Error);
        assert_eq!(h.record().failure, Some(FailureKind::Crashed));
        assert!(h.world.lock().unwrap().launches.is_empty());
    }

    #[test]
    fn test_stopping_slot_without_process_is_stopped() {
        let mut h = Harness::new();
        h.store
            .write_supervisor(
                &h.slot,
                &SupervisorRecord {
                    status: SlotStatus::Stopping,
                    pid: Some(9999),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(h.tick(), SlotStatus::Stopped);
    }

    #[test]
    fn test_observed_intent_mapping() {
        assert_eq!(
            ObservedIntent::from_status(SlotStatus::Starting),
            Some(ObservedIntent::ImplicitStart)
        );
        assert_eq!(ObservedIntent::from_status(SlotStatus::Stopped), None);
        assert_eq!(ObservedIntent::from_status(SlotStatus::Error), None);
    }

    #[test]
    fn test_unchanged_record_is_not_rewritten() {
        let mut h = Harness::new();
        h.tick();
        let first = h.record().updated_at;
        h.advance(5);
        h.tick();
        assert_eq!(h.record().updated_at, first);
    }
}

#[cfg(test)]
mod process_tests {
    //! Same state machine, real processes.

    use super::*;
    use crate::clock::SystemClock;
    use crate::supervisor::process::CommandLauncher;
    use slotwarden_common::SlotConfig;
    use tempfile::tempdir;

    /// Defines `beat`, which writes a heartbeat for the script's run. The
    /// worker arguments put the root in `$1`, the slot in `$4` and the run
    /// id in `$6`.
    const HEARTBEAT: &str = r#"ROOT="$1"; SLOT="$4"; RUN="$6"; beat() { printf '{"run_id":"%s","last_heartbeat":"%s","phase":"SCANNING"}' "$RUN" "$(date -u +%Y-%m-%dT%H:%M:%SZ)" > "$ROOT/slots/$SLOT/worker.json.tmp" && mv "$ROOT/slots/$SLOT/worker.json.tmp" "$ROOT/slots/$SLOT/worker.json"; }"#;

    fn reconciler(root: &std::path::Path, script: String) -> Reconciler {
        let launcher = CommandLauncher::new("sh").with_base_args(["-c".to_string(), script]);
        Reconciler::new(
            SlotStore::new(root),
            Box::new(launcher),
            Arc::new(SystemClock),
            Timing {
                start_grace: Duration::from_secs(10),
                stale_threshold: Duration::from_secs(20),
                stop_timeout: Duration::from_secs(1),
            },
            RecoveryPolicy::default(),
        )
    }

    async fn tick_until(
        r: &mut Reconciler,
        slot: &SlotId,
        want: SlotStatus,
        limit: Duration,
    ) -> SlotStatus {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let status = r.reconcile_slot(slot).unwrap();
            if status == want || tokio::time::Instant::now() >= deadline {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_responsive_worker_stops_with_exit_zero() {
        let dir = tempdir().unwrap();
        let slot = SlotId::new("live").unwrap();
        let script = format!(
            "{HEARTBEAT}; trap 'exit 0' TERM; while true; do beat; sleep 0.1; done"
        );
        let mut r = reconciler(dir.path(), script);
        r.store().provision(&slot, SlotConfig::default()).unwrap();
        r.store()
            .update_control(&slot, |c| c.issue(DesiredCommand::Start, Utc::now()))
            .unwrap();

        let status = tick_until(&mut r, &slot, SlotStatus::Running, Duration::from_secs(5)).await;
        assert_eq!(status, SlotStatus::Running);

        r.store()
            .update_control(&slot, |c| c.issue(DesiredCommand::Stop, Utc::now()))
            .unwrap();
        let status = tick_until(&mut r, &slot, SlotStatus::Stopped, Duration::from_secs(5)).await;
        assert_eq!(status, SlotStatus::Stopped);

        let record = r.store().read_supervisor(&slot).unwrap();
        assert_eq!(record.last_exit_code, Some(0));
        assert!(!record.force_killed);
        assert_eq!(r.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_unresponsive_worker_is_stopped_by_force() {
        let dir = tempdir().unwrap();
        let slot = SlotId::new("stubborn").unwrap();
        let script = format!("{HEARTBEAT}; trap '' TERM; while true; do beat; sleep 0.1; done");
        let mut r = reconciler(dir.path(), script);
        r.store().provision(&slot, SlotConfig::default()).unwrap();
        r.store()
            .update_control(&slot, |c| c.issue(DesiredCommand::Start, Utc::now()))
            .unwrap();
        tick_until(&mut r, &slot, SlotStatus::Running, Duration::from_secs(5)).await;

        r.store()
            .update_control(&slot, |c| c.issue(DesiredCommand::Stop, Utc::now()))
            .unwrap();
        let status = tick_until(&mut r, &slot, SlotStatus::Stopped, Duration::from_secs(6)).await;
        assert_eq!(status, SlotStatus::Stopped);
        assert!(r.store().read_supervisor(&slot).unwrap().force_killed);
    }

    #[tokio::test]
    async fn test_crashing_worker_is_reported() {
        let dir = tempdir().unwrap();
        let slot = SlotId::new("crash").unwrap();
        let mut r = reconciler(dir.path(), "sleep 0.2; exit 3".to_string());
        r.store().provision(&slot, SlotConfig::default()).unwrap();
        r.store()
            .update_control(&slot, |c| c.issue(DesiredCommand::Start, Utc::now()))
            .unwrap();

        let status = tick_until(&mut r, &slot, SlotStatus::Error, Duration::from_secs(5)).await;
        assert_eq!(status, SlotStatus::Error);
        let record = r.store().read_supervisor(&slot).unwrap();
        assert_eq!(record.last_exit_code, Some(3));
        assert_eq!(record.failure, Some(FailureKind::Crashed));
    }
}
