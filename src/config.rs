//! Configuration for the supervisor and its workers.
//!
//! Settings are read from `<root>/slotwarden.toml` and layered
//! file → environment → CLI. Every key is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [supervisor]
//! tick_ms = 1000
//! start_grace_secs = 15
//! stale_threshold_secs = 20
//! stop_timeout_secs = 10
//! worker_program = "/usr/local/bin/slotwarden"
//!
//! [recovery]
//! auto_recover = true
//! max_attempts = 5
//! base_delay_secs = 2
//! multiplier = 2.0
//! max_delay_secs = 60
//! crash_window_secs = 60
//!
//! [worker]
//! heartbeat_interval_ms = 5000
//! scan_interval_ms = 1000
//! max_cooldown_ms = 30000
//! session_poll_ms = 1000
//! teardown_timeout_secs = 5
//! verify_settle_ms = 250
//! http_timeout_secs = 10
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "slotwarden.toml";
pub const DEFAULT_ROOT: &str = ".slotwarden";

pub const ENV_START_GRACE_SECS: &str = "SLOTWARDEN_START_GRACE_SECS";
pub const ENV_STALE_THRESHOLD_SECS: &str = "SLOTWARDEN_STALE_THRESHOLD_SECS";
pub const ENV_STOP_TIMEOUT_SECS: &str = "SLOTWARDEN_STOP_TIMEOUT_SECS";
pub const ENV_TICK_MS: &str = "SLOTWARDEN_TICK_MS";
pub const ENV_WORKER_PROGRAM: &str = "SLOTWARDEN_WORKER_PROGRAM";

/// Reconciliation loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Interval between reconciliation passes
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// How long a slot may stay STARTING without a heartbeat
    #[serde(default = "default_start_grace_secs")]
    pub start_grace_secs: u64,
    /// Heartbeat age after which a RUNNING worker is considered hung
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    /// How long a graceful stop may take before the worker is killed
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Program launched for each worker (default: this executable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<String>,
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_start_grace_secs() -> u64 {
    15
}

fn default_stale_threshold_secs() -> u64 {
    20
}

fn default_stop_timeout_secs() -> u64 {
    10
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            start_grace_secs: default_start_grace_secs(),
            stale_threshold_secs: default_stale_threshold_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            worker_program: None,
        }
    }
}

/// Crash-loop protection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySection {
    /// Restart crashed or hung workers automatically (slots may override)
    #[serde(default)]
    pub auto_recover: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// A run that stays RUNNING this long resets the attempt counter
    #[serde(default = "default_crash_window_secs")]
    pub crash_window_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_secs() -> u64 {
    2
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_secs() -> u64 {
    60
}

fn default_crash_window_secs() -> u64 {
    60
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            auto_recover: false,
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay_secs(),
            crash_window_secs: default_crash_window_secs(),
        }
    }
}

/// Capture worker pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Base pause between scan cycles
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Ceiling for the error-adaptive pause
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
    /// Poll interval while waiting for a refreshed session
    #[serde(default = "default_session_poll_ms")]
    pub session_poll_ms: u64,
    /// How long shutdown waits for in-flight verification
    #[serde(default = "default_teardown_timeout_secs")]
    pub teardown_timeout_secs: u64,
    /// Pause before the verifier inspects the confirmation view
    #[serde(default = "default_verify_settle_ms")]
    pub verify_settle_ms: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_scan_interval_ms() -> u64 {
    1000
}

fn default_max_cooldown_ms() -> u64 {
    30_000
}

fn default_session_poll_ms() -> u64 {
    1000
}

fn default_teardown_timeout_secs() -> u64 {
    5
}

fn default_verify_settle_ms() -> u64 {
    250
}

fn default_http_timeout_secs() -> u64 {
    10
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            scan_interval_ms: default_scan_interval_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
            session_poll_ms: default_session_poll_ms(),
            teardown_timeout_secs: default_teardown_timeout_secs(),
            verify_settle_ms: default_verify_settle_ms(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

/// Parsed `slotwarden.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotwardenToml {
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub worker: WorkerSection,
}

impl SlotwardenToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse slotwarden.toml")
    }

    /// Load `<root>/slotwarden.toml`, or defaults when it does not exist.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize slotwarden.toml")
    }

    /// Apply `SLOTWARDEN_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Vec<String> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Unparseable values are skipped and
    /// reported as warnings.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        let numeric = [
            (ENV_START_GRACE_SECS, &mut self.supervisor.start_grace_secs),
            (
                ENV_STALE_THRESHOLD_SECS,
                &mut self.supervisor.stale_threshold_secs,
            ),
            (ENV_STOP_TIMEOUT_SECS, &mut self.supervisor.stop_timeout_secs),
            (ENV_TICK_MS, &mut self.supervisor.tick_ms),
        ];
        for (key, slot) in numeric {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse::<u64>() {
                    Ok(value) => *slot = value,
                    Err(_) => warnings.push(format!("Ignoring {}={:?}: not a number", key, raw)),
                }
            }
        }
        if let Some(program) = lookup(ENV_WORKER_PROGRAM)
            && !program.trim().is_empty()
        {
            self.supervisor.worker_program = Some(program);
        }
        warnings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let s = &self.supervisor;
        let w = &self.worker;
        let r = &self.recovery;

        if s.tick_ms == 0 {
            warnings.push("supervisor.tick_ms is 0: the loop will spin".into());
        }
        if s.stale_threshold_secs * 1000 <= w.heartbeat_interval_ms {
            warnings.push(format!(
                "supervisor.stale_threshold_secs ({}s) must exceed worker.heartbeat_interval_ms ({}ms)",
                s.stale_threshold_secs, w.heartbeat_interval_ms
            ));
        }
        if s.start_grace_secs * 1000 < w.heartbeat_interval_ms {
            warnings.push(format!(
                "supervisor.start_grace_secs ({}s) is shorter than one heartbeat interval",
                s.start_grace_secs
            ));
        }
        if s.stop_timeout_secs < w.teardown_timeout_secs {
            warnings.push(format!(
                "supervisor.stop_timeout_secs ({}s) is shorter than worker.teardown_timeout_secs ({}s); workers may be killed mid-teardown",
                s.stop_timeout_secs, w.teardown_timeout_secs
            ));
        }
        if r.multiplier < 1.0 {
            warnings.push(format!(
                "recovery.multiplier {} is below 1.0: delays will shrink",
                r.multiplier
            ));
        }
        if r.max_delay_secs < r.base_delay_secs {
            warnings.push("recovery.max_delay_secs is below recovery.base_delay_secs".into());
        }
        if w.max_cooldown_ms < w.scan_interval_ms {
            warnings.push("worker.max_cooldown_ms is below worker.scan_interval_ms".into());
        }

        warnings
    }
}

/// Directory for the supervisor's own rolling log.
pub fn log_dir(root: &Path) -> PathBuf {
    root.join("logs")
}

/// Effective configuration for one state root.
#[derive(Debug, Clone)]
pub struct Settings {
    pub root: PathBuf,
    pub toml: SlotwardenToml,
    /// CLI override: debug logging
    pub verbose: bool,
    /// CLI override: JSON log lines
    pub log_json: bool,
}

impl Settings {
    /// Load `<root>/slotwarden.toml` and apply environment overrides.
    pub fn load(root: PathBuf) -> Result<Self> {
        let mut toml = SlotwardenToml::load_or_default(&root)?;
        for warning in toml.apply_env() {
            tracing::warn!("{}", warning);
        }
        Ok(Self {
            root,
            toml,
            verbose: false,
            log_json: false,
        })
    }

    /// Load with CLI overrides.
    pub fn with_cli_args(root: PathBuf, verbose: bool, log_json: bool) -> Result<Self> {
        let mut settings = Self::load(root)?;
        settings.verbose = verbose;
        settings.log_json = log_json;
        Ok(settings)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("supervisor.lock")
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.toml.supervisor.tick_ms.max(1))
    }

    /// Program the supervisor launches for workers (config → current exe).
    pub fn worker_program(&self) -> Result<PathBuf> {
        match &self.toml.supervisor.worker_program {
            Some(program) => Ok(PathBuf::from(program)),
            None => std::env::current_exe().context("Failed to resolve current executable"),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = SlotwardenToml::parse("").unwrap();
        assert_eq!(toml.supervisor.tick_ms, 1000);
        assert_eq!(toml.supervisor.start_grace_secs, 15);
        assert_eq!(toml.supervisor.stale_threshold_secs, 20);
        assert_eq!(toml.supervisor.stop_timeout_secs, 10);
        assert!(!toml.recovery.auto_recover);
        assert_eq!(toml.recovery.max_attempts, 5);
        assert_eq!(toml.worker.heartbeat_interval_ms, 5000);
    }

    #[test]
    fn test_parse_partial_sections() {
        let content = r#"
[supervisor]
start_grace_secs = 45

[recovery]
auto_recover = true
multiplier = 3.0
"#;
        let toml = SlotwardenToml::parse(content).unwrap();
        assert_eq!(toml.supervisor.start_grace_secs, 45);
        assert_eq!(toml.supervisor.stale_threshold_secs, 20);
        assert!(toml.recovery.auto_recover);
        assert_eq!(toml.recovery.multiplier, 3.0);
        assert_eq!(toml.recovery.base_delay_secs, 2);
    }

    #[test]
    fn test_parse_rejects_malformed_toml() {
        assert!(SlotwardenToml::parse("[supervisor\ntick_ms = ").is_err());
    }

    #[test]
    fn test_overrides_take_precedence_over_file() {
        let mut toml = SlotwardenToml::parse("[supervisor]\nstart_grace_secs = 45\n").unwrap();
        let env: HashMap<&str, &str> = [
            (ENV_START_GRACE_SECS, "90"),
            (ENV_TICK_MS, "250"),
            (ENV_WORKER_PROGRAM, "/opt/worker"),
        ]
        .into_iter()
        .collect();

        let warnings = toml.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert!(warnings.is_empty());
        assert_eq!(toml.supervisor.start_grace_secs, 90);
        assert_eq!(toml.supervisor.tick_ms, 250);
        assert_eq!(
            toml.supervisor.worker_program.as_deref(),
            Some("/opt/worker")
        );
    }

    #[test]
    fn test_unparseable_override_is_reported_and_skipped() {
        let mut toml = SlotwardenToml::default();
        let warnings = toml.apply_overrides(|k| {
            (k == ENV_STOP_TIMEOUT_SECS).then(|| "soon".to_string())
        });
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains(ENV_STOP_TIMEOUT_SECS));
        assert_eq!(toml.supervisor.stop_timeout_secs, 10);
    }

    #[test]
    fn test_validate_defaults_clean() {
        assert!(SlotwardenToml::default().validate().is_empty());
    }

    #[test]
    fn test_validate_flags_threshold_below_heartbeat() {
        let mut toml = SlotwardenToml::default();
        toml.supervisor.stale_threshold_secs = 2;
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("stale_threshold_secs")));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = SlotwardenToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.supervisor.tick_ms, 1000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut toml = SlotwardenToml::default();
        toml.recovery.auto_recover = true;
        toml.worker.scan_interval_ms = 200;
        toml.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let loaded = SlotwardenToml::load_or_default(dir.path()).unwrap();
        assert!(loaded.recovery.auto_recover);
        assert_eq!(loaded.worker.scan_interval_ms, 200);
    }

    #[test]
    fn test_settings_paths() {
        let settings = Settings {
            root: PathBuf::from("/srv/slots"),
            toml: SlotwardenToml::default(),
            verbose: false,
            log_json: false,
        };
        assert_eq!(
            settings.lock_file(),
            PathBuf::from("/srv/slots/supervisor.lock")
        );
        assert_eq!(log_dir(&settings.root), PathBuf::from("/srv/slots/logs"));
        assert_eq!(settings.tick(), Duration::from_millis(1000));
    }
}
