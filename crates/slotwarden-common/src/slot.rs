use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

const MAX_SLOT_ID_LEN: usize = 64;

/// Errors raised when parsing a slot identifier.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotIdError {
    #[error("slot id must not be empty")]
    Empty,

    #[error("slot id '{0}' is longer than 64 characters")]
    TooLong(String),

    #[error("slot id '{0}' may only contain ASCII letters, digits, '-' and '_'")]
    InvalidChar(String),
}

/// Stable identity of a slot. Doubles as the slot's directory name, so it is
/// restricted to a filesystem-safe alphabet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotId(String);

impl SlotId {
    pub fn new(id: impl Into<String>) -> Result<Self, SlotIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(SlotIdError::Empty);
        }
        if id.len() > MAX_SLOT_ID_LEN {
            return Err(SlotIdError::TooLong(id));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SlotIdError::InvalidChar(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SlotId {
    type Error = SlotIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SlotId> for String {
    fn from(id: SlotId) -> Self {
        id.0
    }
}

impl FromStr for SlotId {
    type Err = SlotIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one worker process lifetime. A fresh id is minted on every spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex characters, used in log banners.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command written by the control plane.
///
/// Commands are edge-triggered: each one is paired with a `command_seq` and is
/// applied once, when the supervisor acknowledges that sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DesiredCommand {
    #[default]
    None,
    Start,
    Stop,
    Restart,
}

impl fmt::Display for DesiredCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesiredCommand::None => write!(f, "NONE"),
            DesiredCommand::Start => write!(f, "START"),
            DesiredCommand::Stop => write!(f, "STOP"),
            DesiredCommand::Restart => write!(f, "RESTART"),
        }
    }
}

impl FromStr for DesiredCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(DesiredCommand::None),
            "start" => Ok(DesiredCommand::Start),
            "stop" => Ok(DesiredCommand::Stop),
            "restart" => Ok(DesiredCommand::Restart),
            _ => Err(format!(
                "Invalid command '{}'. Valid values: start, stop, restart, none",
                s
            )),
        }
    }
}

/// Observed lifecycle status, owned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlotStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl SlotStatus {
    /// Whether a worker process is expected to exist in this status.
    pub fn expects_process(self) -> bool {
        matches!(
            self,
            SlotStatus::Starting | SlotStatus::Running | SlotStatus::Stopping
        )
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotStatus::Stopped => "STOPPED",
            SlotStatus::Starting => "STARTING",
            SlotStatus::Running => "RUNNING",
            SlotStatus::Stopping => "STOPPING",
            SlotStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Worker phase, owned by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Booting,
    LoginRequired,
    Scanning,
    Matching,
    Claiming,
    Verifying,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Booting => "BOOTING",
            Phase::LoginRequired => "LOGIN_REQUIRED",
            Phase::Scanning => "SCANNING",
            Phase::Matching => "MATCHING",
            Phase::Claiming => "CLAIMING",
            Phase::Verifying => "VERIFYING",
            Phase::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Why the supervisor last moved a slot out of the happy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SpawnFailure,
    StartTimeout,
    HeartbeatTimeout,
    Crashed,
    StateStoreCorruption,
}

impl FailureKind {
    /// Spawn failures are retried under the backoff policy even when
    /// auto-recovery of crashed runs is disabled.
    pub fn always_retried(self) -> bool {
        matches!(self, FailureKind::SpawnFailure)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::SpawnFailure => "spawn_failure",
            FailureKind::StartTimeout => "start_timeout",
            FailureKind::HeartbeatTimeout => "heartbeat_timeout",
            FailureKind::Crashed => "crashed",
            FailureKind::StateStoreCorruption => "state_store_corruption",
        };
        f.write_str(s)
    }
}

/// Counters published with every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Claims per minute over the last heartbeat interval.
    #[serde(default)]
    pub throughput: f64,
    #[serde(default)]
    pub items_seen: u64,
    #[serde(default)]
    pub claimed_total: u64,
    #[serde(default)]
    pub verified_total: u64,
    #[serde(default)]
    pub rejected_total: u64,
    #[serde(default)]
    pub verify_mismatches: u64,
    #[serde(default)]
    pub pages_fetched: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Metrics {
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors += 1;
        self.last_error = Some(message.into());
        let pages = self.pages_fetched.max(1) as f64;
        self.error_rate = ((self.errors as f64 / pages) * 1000.0).round() / 1000.0;
    }
}

/// Days/hours window in which a worker is allowed to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Day names or abbreviations ("mon", "tuesday", ...). Empty means every day.
    #[serde(default)]
    pub days: Vec<String>,
    /// "HH:MM", inclusive.
    #[serde(default)]
    pub window_start: Option<String>,
    /// "HH:MM", exclusive. A window ending before it starts wraps midnight.
    #[serde(default)]
    pub window_end: Option<String>,
    /// Offset of the schedule's local time from UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

/// Per-run limits after which the worker stops itself gracefully.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunLimits {
    #[serde(default)]
    pub max_run_minutes: Option<u64>,
    #[serde(default)]
    pub max_claims_per_run: Option<u64>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
}

/// Where the worker reads its feed and drives its claim page.
///
/// Each location is either an `http(s)://` URL or a local path (optionally
/// with a `file://` prefix).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub feed_url: String,
    #[serde(default)]
    pub page_url: String,
    #[serde(default)]
    pub confirmation_url: String,
    /// File refreshed by the external session-recovery actor.
    #[serde(default)]
    pub session_file: Option<String>,
}

fn default_max_item_age_seconds() -> u64 {
    30
}

fn default_max_claims_per_cycle() -> usize {
    5
}

/// Slot configuration, written only by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotConfig {
    #[serde(default = "default_max_item_age_seconds")]
    pub max_item_age_seconds: u64,
    #[serde(default)]
    pub allow_unknown_age: bool,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub exclude_terms: Vec<String>,
    #[serde(default)]
    pub region_filters: Vec<String>,
    #[serde(default)]
    pub require_contact_email: bool,
    #[serde(default)]
    pub require_contact_phone: bool,
    #[serde(default)]
    pub require_contact_verified: bool,
    /// 0-100; higher values tighten contact requirements during matching.
    #[serde(default)]
    pub quality_bias: i64,
    #[serde(default = "default_max_claims_per_cycle")]
    pub max_claims_per_cycle: usize,
    /// Overrides the supervisor's auto-recovery default for this slot.
    #[serde(default)]
    pub auto_recover: Option<bool>,
    #[serde(default)]
    pub limits: RunLimits,
    #[serde(default)]
    pub source: SourceConfig,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            max_item_age_seconds: default_max_item_age_seconds(),
            allow_unknown_age: false,
            keywords: Vec::new(),
            exclude_terms: Vec::new(),
            region_filters: Vec::new(),
            require_contact_email: false,
            require_contact_phone: false,
            require_contact_verified: false,
            quality_bias: 0,
            max_claims_per_cycle: default_max_claims_per_cycle(),
            auto_recover: None,
            limits: RunLimits::default(),
            source: SourceConfig::default(),
        }
    }
}

impl SlotConfig {
    /// Quality bias clamped into 0-100.
    pub fn quality_bias(&self) -> u8 {
        self.quality_bias.clamp(0, 100) as u8
    }

    /// Validate the configuration and return human-readable warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !(0..=100).contains(&self.quality_bias) {
            warnings.push(format!(
                "quality_bias {} is outside 0-100 and will be clamped",
                self.quality_bias
            ));
        }
        if self.max_item_age_seconds == 0 && !self.allow_unknown_age {
            warnings.push("max_item_age_seconds is 0: only items aged exactly 0s pass".into());
        }
        if self.max_claims_per_cycle == 0 {
            warnings.push("max_claims_per_cycle is 0: no item will ever be claimed".into());
        }
        if self.source.feed_url.trim().is_empty() {
            warnings.push("source.feed_url is empty: the worker has nothing to scan".into());
        }
        if self.source.page_url.trim().is_empty() {
            warnings.push("source.page_url is empty: claims cannot be placed".into());
        }
        for term in self.keywords.iter().filter(|k| self.exclude_terms.contains(k)) {
            warnings.push(format!(
                "'{}' is both a keyword and an exclusion; exclusion wins",
                term
            ));
        }
        warnings
    }
}

/// Document owned by the control plane: desired command and configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlRecord {
    #[serde(default)]
    pub command: DesiredCommand,
    #[serde(default)]
    pub command_seq: u64,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: SlotConfig,
}

impl ControlRecord {
    /// Issue a new command, bumping the sequence so it is seen as pending.
    pub fn issue(&mut self, command: DesiredCommand, now: DateTime<Utc>) {
        self.command = command;
        self.command_seq += 1;
        self.issued_at = Some(now);
    }
}

/// Document owned by the supervisor: status, pid and recovery bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupervisorRecord {
    #[serde(default)]
    pub status: SlotStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub spawned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub running_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_requested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub force_killed: bool,
    /// A start is owed as soon as the current process is confirmed gone.
    #[serde(default)]
    pub pending_start: bool,
    #[serde(default)]
    pub acked_command_seq: u64,
    #[serde(default)]
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SupervisorRecord {
    /// The control plane's command, if its sequence number has not been
    /// acknowledged yet. A pending `NONE` still has to be acknowledged.
    pub fn pending_command(&self, control: &ControlRecord) -> Option<DesiredCommand> {
        if control.command_seq > self.acked_command_seq {
            Some(control.command)
        } else {
            None
        }
    }

    /// Record a failure on the supervisor side.
    pub fn fail(&mut self, status: SlotStatus, kind: FailureKind, message: impl Into<String>) {
        self.status = status;
        self.failure = Some(kind);
        self.last_error = Some(message.into());
    }
}

/// Document owned by the worker: heartbeat, phase and metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

impl WorkerRecord {
    /// Heartbeat timestamp, but only if it belongs to the given run.
    pub fn heartbeat_for(&self, run_id: Option<RunId>) -> Option<DateTime<Utc>> {
        match (self.run_id, run_id) {
            (Some(mine), Some(expected)) if mine == expected => self.last_heartbeat,
            _ => None,
        }
    }
}

/// Merged read view of a slot, as exposed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub slot_id: SlotId,
    pub command: DesiredCommand,
    pub command_seq: u64,
    pub status: SlotStatus,
    pub pid: Option<u32>,
    pub run_id: Option<RunId>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub phase: Phase,
    pub metrics: Metrics,
    pub config: SlotConfig,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub failure: Option<FailureKind>,
    pub stop_reason: Option<String>,
}

impl SlotRecord {
    pub fn merge(
        slot_id: SlotId,
        control: &ControlRecord,
        supervisor: &SupervisorRecord,
        worker: Option<&WorkerRecord>,
    ) -> Self {
        let worker = worker.cloned().unwrap_or_default();
        Self {
            slot_id,
            command: control.command,
            command_seq: control.command_seq,
            status: supervisor.status,
            pid: supervisor.pid,
            run_id: supervisor.run_id,
            last_heartbeat: worker.last_heartbeat,
            phase: worker.phase,
            metrics: worker.metrics,
            config: control.config.clone(),
            last_exit_code: supervisor.last_exit_code,
            last_error: supervisor.last_error.clone(),
            failure: supervisor.failure,
            stop_reason: worker.stop_reason,
        }
    }
}
