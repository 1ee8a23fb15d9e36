//! Item age, as reported by the feed itself.
//!
//! Local fetch time is never used: an item's age comes from the feed's
//! explicit `age_seconds`, its relative age text, or `posted_at` measured
//! against the snapshot's `generated_at`, in that order.

use chrono::{DateTime, Utc};
use regex::Regex;
use slotwarden_common::{RejectReason, SlotConfig};
use std::sync::LazyLock;

use super::feed::FeedItem;

static AGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d+)\s*(seconds|second|secs|sec|s|minutes|minute|mins|min|m|hours|hour|hrs|hr|h|days|day|d)\b",
    )
    .unwrap()
});

/// Parse relative age text such as "5 mins ago", "1 hr" or "just now".
pub fn parse_age_text(text: &str) -> Option<u64> {
    let text = text.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }
    if text.contains("just now") || text == "now" {
        return Some(0);
    }
    let caps = AGE_REGEX.captures(&text)?;
    let amount: u64 = caps[1].parse().ok()?;
    let unit = &caps[2];
    let multiplier = if unit.starts_with('s') {
        1
    } else if unit.starts_with('m') {
        60
    } else if unit.starts_with('h') {
        3600
    } else {
        86_400
    };
    amount.checked_mul(multiplier)
}

/// Age of an item in seconds, or `None` if the feed gives no way to tell.
pub fn item_age(item: &FeedItem, generated_at: Option<DateTime<Utc>>) -> Option<u64> {
    if let Some(age) = item.age_seconds {
        return Some(age);
    }
    if let Some(age) = item.age_text.as_deref().and_then(parse_age_text) {
        return Some(age);
    }
    match (item.posted_at, generated_at) {
        (Some(posted), Some(generated)) => Some((generated - posted).num_seconds().max(0) as u64),
        _ => None,
    }
}

/// Apply the freshness window.
pub fn check(age: Option<u64>, config: &SlotConfig) -> Result<(), RejectReason> {
    match age {
        Some(age) if age > config.max_item_age_seconds => Err(RejectReason::Stale),
        Some(_) => Ok(()),
        None if config.allow_unknown_age => Ok(()),
        None => Err(RejectReason::UnknownAge),
    }
}
