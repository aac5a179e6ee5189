//! Eligibility filter
//!
//! Decides whether a user is considered for detection at all. Brand new
//! accounts and users whose activity never leaves their home region only
//! produce noise, so they are dropped before any detector runs.

use chrono::{DateTime, Months, Utc};
use std::net::IpAddr;

use crate::config::EligibilityConfig;
use crate::models::{AuthEvent, UserProfile};

const STATE_ABBREVIATIONS: [(&str, &str); 50] = [
    ("Alabama", "AL"),
    ("Alaska", "AK"),
    ("Arizona", "AZ"),
    ("Arkansas", "AR"),
    ("California", "CA"),
    ("Colorado", "CO"),
    ("Connecticut", "CT"),
    ("Delaware", "DE"),
    ("Florida", "FL"),
    ("Georgia", "GA"),
    ("Hawaii", "HI"),
    ("Idaho", "ID"),
    ("Illinois", "IL"),
    ("Indiana", "IN"),
    ("Iowa", "IA"),
    ("Kansas", "KS"),
    ("Kentucky", "KY"),
    ("Louisiana", "LA"),
    ("Maine", "ME"),
    ("Maryland", "MD"),
    ("Massachusetts", "MA"),
    ("Michigan", "MI"),
    ("Minnesota", "MN"),
    ("Mississippi", "MS"),
    ("Missouri", "MO"),
    ("Montana", "MT"),
    ("Nebraska", "NE"),
    ("Nevada", "NV"),
    ("New Hampshire", "NH"),
    ("New Jersey", "NJ"),
    ("New Mexico", "NM"),
    ("New York", "NY"),
    ("North Carolina", "NC"),
    ("North Dakota", "ND"),
    ("Ohio", "OH"),
    ("Oklahoma", "OK"),
    ("Oregon", "OR"),
    ("Pennsylvania", "PA"),
    ("Rhode Island", "RI"),
    ("South Carolina", "SC"),
    ("South Dakota", "SD"),
    ("Tennessee", "TN"),
    ("Texas", "TX"),
    ("Utah", "UT"),
    ("Vermont", "VT"),
    ("Virginia", "VA"),
    ("Washington", "WA"),
    ("West Virginia", "WV"),
    ("Wisconsin", "WI"),
    ("Wyoming", "WY"),
];

/// Why a user was excluded from detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    NewAccount,
    HomeRegionOnly,
}

/// Canonical form of a region name: US state abbreviations expand to the
/// full name and comparison is case-insensitive.
pub fn normalize_region(region: &str) -> String {
    let trimmed = region.trim();
    STATE_ABBREVIATIONS
        .iter()
        .find(|(name, code)| {
            code.eq_ignore_ascii_case(trimmed) || name.eq_ignore_ascii_case(trimmed)
        })
        .map(|(name, _)| name.to_ascii_lowercase())
        .unwrap_or_else(|| trimmed.to_ascii_lowercase())
}

pub fn same_region(a: &str, b: &str) -> bool {
    normalize_region(a) == normalize_region(b)
}

pub struct EligibilityFilter {
    min_account_age: Months,
    home_equivalents: Vec<String>,
    vpn_addresses: Vec<IpAddr>,
}

impl EligibilityFilter {
    pub fn new(config: &EligibilityConfig, vpn_addresses: &[IpAddr]) -> Self {
        EligibilityFilter {
            min_account_age: Months::new(config.min_account_age_months),
            home_equivalents: config
                .home_equivalent_regions
                .iter()
                .map(|r| normalize_region(r))
                .collect(),
            vpn_addresses: vpn_addresses.to_vec(),
        }
    }

    /// First matching exclusion rule, if any
    ///
    /// `events` are the user's in-window events; `as_of` is the evaluation
    /// time.
    pub fn exclusion(
        &self,
        profile: &UserProfile,
        events: &[AuthEvent],
        as_of: DateTime<Utc>,
    ) -> Option<Exclusion> {
        if self.is_new_account(profile, as_of) {
            return Some(Exclusion::NewAccount);
        }
        if self.is_home_region_only(profile, events) {
            return Some(Exclusion::HomeRegionOnly);
        }
        None
    }

    pub fn is_eligible(
        &self,
        profile: &UserProfile,
        events: &[AuthEvent],
        as_of: DateTime<Utc>,
    ) -> bool {
        self.exclusion(profile, events, as_of).is_none()
    }

    fn is_new_account(&self, profile: &UserProfile, as_of: DateTime<Utc>) -> bool {
        match as_of.checked_sub_months(self.min_account_age) {
            Some(cutoff) => profile.created_at > cutoff,
            None => false,
        }
    }

    /// Every event with a usable region is from home. Events without a
    /// region, or from a VPN egress address, carry no regional signal; a user
    /// with no regional signal at all stays eligible.
    fn is_home_region_only(&self, profile: &UserProfile, events: &[AuthEvent]) -> bool {
        let home = match profile.home_region.as_deref() {
            Some(home) => normalize_region(home),
            None => return false,
        };

        let mut regions = events
            .iter()
            .filter(|e| !self.is_vpn(e))
            .filter_map(|e| e.region())
            .map(normalize_region)
            .peekable();

        if regions.peek().is_none() {
            return false;
        }

        regions.all(|r| r == home || self.home_equivalents.contains(&r))
    }

    fn is_vpn(&self, event: &AuthEvent) -> bool {
        event
            .source_ip
            .map(|ip| self.vpn_addresses.contains(&ip))
            .unwrap_or(false)
    }
}
