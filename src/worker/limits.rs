//! Run limits and inter-cycle pacing.

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Utc, Weekday};
use slotwarden_common::{RunLimits, Schedule};
use std::time::Duration;

pub const OUTSIDE_SCHEDULE: &str = "outside_schedule";
pub const MAX_RUNTIME_REACHED: &str = "max_runtime_reached";
pub const CLAIM_TARGET_REACHED: &str = "claim_target_reached";

/// Reason the worker should stop itself, if any limit is reached.
pub fn check(
    limits: &RunLimits,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    claimed_total: u64,
) -> Option<&'static str> {
    if let Some(schedule) = &limits.schedule
        && !in_schedule(schedule, now)
    {
        return Some(OUTSIDE_SCHEDULE);
    }
    if let Some(minutes) = limits.max_run_minutes
        && i64::try_from(minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .is_some_and(|limit| now - started_at >= limit)
    {
        return Some(MAX_RUNTIME_REACHED);
    }
    if let Some(target) = limits.max_claims_per_run
        && claimed_total >= target
    {
        return Some(CLAIM_TARGET_REACHED);
    }
    None
}

/// Whether `now` falls inside the schedule, evaluated in the schedule's own
/// UTC offset. A window that wraps midnight belongs to the day it opened on.
pub fn in_schedule(schedule: &Schedule, now: DateTime<Utc>) -> bool {
    let local = now.naive_utc() + TimeDelta::minutes(schedule.utc_offset_minutes as i64);
    let time = local.time();
    let start = schedule.window_start.as_deref().and_then(parse_hhmm);
    let end = schedule.window_end.as_deref().and_then(parse_hhmm);

    let (inside, opened_yesterday) = match (start, end) {
        (Some(s), Some(e)) if s < e => (time >= s && time < e, false),
        (Some(s), Some(e)) if s > e => {
            if time >= s {
                (true, false)
            } else {
                (time < e, true)
            }
        }
        (Some(s), None) => (time >= s, false),
        (None, Some(e)) => (time < e, false),
        _ => (true, false),
    };
    if !inside {
        return false;
    }

    let days: Vec<Weekday> = schedule.days.iter().filter_map(|d| parse_day(d)).collect();
    if days.is_empty() {
        return true;
    }
    let day = if opened_yesterday {
        local.date().weekday().pred()
    } else {
        local.date().weekday()
    };
    days.contains(&day)
}

/// Problems with a schedule that would make it silently ignore entries.
pub fn validate_schedule(schedule: &Schedule) -> Vec<String> {
    let mut warnings = Vec::new();
    for (name, value) in [
        ("window_start", &schedule.window_start),
        ("window_end", &schedule.window_end),
    ] {
        if let Some(v) = value
            && parse_hhmm(v).is_none()
        {
            warnings.push(format!("schedule.{} '{}' is not HH:MM and is ignored", name, v));
        }
    }
    for day in schedule.days.iter().filter(|d| parse_day(d).is_none()) {
        warnings.push(format!("schedule day '{}' is not a weekday name and is ignored", day));
    }
    warnings
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

fn parse_day(s: &str) -> Option<Weekday> {
    s.trim().parse().ok()
}

/// Pause between scan cycles, stretched as the error rate climbs.
pub fn cooldown(error_rate: f64, base: Duration, max: Duration) -> Duration {
    let factor = if error_rate < 0.05 {
        1
    } else if error_rate < 0.15 {
        5
    } else if error_rate < 0.30 {
        10
    } else {
        20
    };
    base.saturating_mul(factor).min(max)
}
