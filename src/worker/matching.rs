//! Item filtering: exclusions, keywords, regions and contact requirements.
//!
//! Checks run in a fixed order and the first failure is the reason recorded
//! in the ledger.

use regex::Regex;
use slotwarden_common::{RejectReason, SlotConfig};
use std::collections::HashSet;
use std::sync::LazyLock;

use super::feed::{Contact, FeedItem};

static TOKEN_SPLIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}]+").unwrap());

/// Quality bias at or above which some contact channel is required.
pub const BIAS_ANY_CONTACT: u8 = 40;
/// ... a verified contact channel is required.
pub const BIAS_VERIFIED_CONTACT: u8 = 70;
/// ... both email and phone must be present and verified.
pub const BIAS_FULLY_VERIFIED: u8 = 90;

pub fn evaluate(item: &FeedItem, config: &SlotConfig) -> Result<(), RejectReason> {
    let haystack = format!("{} {}", item.title, item.text).to_lowercase();

    if config
        .exclude_terms
        .iter()
        .map(|t| t.trim().to_lowercase())
        .any(|t| !t.is_empty() && haystack.contains(&t))
    {
        return Err(RejectReason::ExcludedTerm);
    }

    let keywords: Vec<String> = config
        .keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    if !keywords.is_empty() && !keywords.iter().any(|k| haystack.contains(k)) {
        return Err(RejectReason::KeywordMiss);
    }

    if let Some(region) = item.region.as_deref()
        && !region_allowed(region, &config.region_filters)
    {
        return Err(RejectReason::RegionMismatch);
    }

    check_contact(&item.contact, config)
}

/// Whether `region` passes the filters. Short codes (three characters or
/// fewer) must equal a token of the region; longer names may appear anywhere
/// in it. An empty region carries no information and passes.
pub fn region_allowed(region: &str, filters: &[String]) -> bool {
    let region = region.trim().to_lowercase();
    if filters.is_empty() || region.is_empty() {
        return true;
    }
    let tokens: HashSet<&str> = TOKEN_SPLIT.split(&region).filter(|t| !t.is_empty()).collect();

    filters
        .iter()
        .map(|f| f.trim().to_lowercase())
        .filter(|f| !f.is_empty())
        .any(|f| {
            if f.chars().count() <= 3 {
                tokens.contains(f.as_str())
            } else {
                region.contains(&f)
            }
        })
}

fn check_contact(contact: &Contact, config: &SlotConfig) -> Result<(), RejectReason> {
    let has_email = contact.has_email();
    let has_phone = contact.has_phone();

    if config.require_contact_email && !has_email {
        return Err(RejectReason::ContactMissingEmail);
    }
    if config.require_contact_phone && !has_phone {
        return Err(RejectReason::ContactMissingPhone);
    }
    if config.require_contact_verified {
        let email_ok = !config.require_contact_email || contact.email_verified;
        let phone_ok = !config.require_contact_phone || contact.phone_verified;
        let any_required = config.require_contact_email || config.require_contact_phone;
        if !(email_ok && phone_ok) || (!any_required && !contact.has_verified_channel()) {
            return Err(RejectReason::ContactUnverified);
        }
    }

    let bias = config.quality_bias();
    if bias >= BIAS_FULLY_VERIFIED {
        if !has_email {
            return Err(RejectReason::ContactMissingEmail);
        }
        if !has_phone {
            return Err(RejectReason::ContactMissingPhone);
        }
        if !(contact.email_verified && contact.phone_verified) {
            return Err(RejectReason::ContactUnverified);
        }
    } else if bias >= BIAS_VERIFIED_CONTACT {
        if !has_email && !has_phone {
            return Err(RejectReason::ContactMissing);
        }
        if !contact.has_verified_channel() {
            return Err(RejectReason::ContactUnverified);
        }
    } else if bias >= BIAS_ANY_CONTACT && !has_email && !has_phone {
        return Err(RejectReason::ContactMissing);
    }

    Ok(())
}
