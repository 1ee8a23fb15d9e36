//! Crash-loop protection: decides whether and when a failed slot is retried.

use slotwarden_common::FailureKind;
use std::time::Duration;

use crate::config::RecoverySection;

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// Default for slots without their own `auto_recover` setting.
    pub auto_recover: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// A run that stayed RUNNING at least this long resets the attempt count.
    pub crash_window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecoveryDecision {
    /// Spawn again after `delay`; `attempt` is 1-indexed.
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted; the slot stays in ERROR until a new START.
    GiveUp { attempts: u32 },
    /// Recovery does not apply to this failure for this slot.
    NotApplicable,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from(&RecoverySection::default())
    }
}

impl From<&RecoverySection> for RecoveryPolicy {
    fn from(section: &RecoverySection) -> Self {
        Self {
            auto_recover: section.auto_recover,
            max_attempts: section.max_attempts,
            base_delay: Duration::from_secs(section.base_delay_secs),
            multiplier: section.multiplier,
            max_delay: Duration::from_secs(section.max_delay_secs),
            crash_window: Duration::from_secs(section.crash_window_secs),
        }
    }
}

impl RecoveryPolicy {
    /// Delay before attempt number `attempt` (1-indexed):
    /// `base_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Whether a failure of this kind is retried for a slot.
    pub fn applies_to(&self, kind: FailureKind, slot_override: Option<bool>) -> bool {
        if kind.always_retried() {
            return true;
        }
        match kind {
            FailureKind::HeartbeatTimeout | FailureKind::Crashed => {
                slot_override.unwrap_or(self.auto_recover)
            }
            _ => false,
        }
    }

    /// Decide what follows a failure, given how many attempts were already made.
    pub fn decide(
        &self,
        kind: FailureKind,
        attempts_so_far: u32,
        slot_override: Option<bool>,
    ) -> RecoveryDecision {
        if !self.applies_to(kind, slot_override) {
            return RecoveryDecision::NotApplicable;
        }
        if attempts_so_far >= self.max_attempts {
            return RecoveryDecision::GiveUp {
                attempts: attempts_so_far,
            };
        }
        let attempt = attempts_so_far + 1;
        RecoveryDecision::Retry {
            attempt,
            delay: self.next_delay(attempt),
        }
    }
}
