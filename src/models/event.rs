use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;

/// Result reported by the 2FA provider for one authentication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    /// The user pressed "report fraud" on the push prompt
    FraudReport,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::FraudReport => "fraud_report",
        };
        write!(f, "{}", s)
    }
}

/// System the authentication attempt was protecting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSystem {
    #[serde(rename = "primary_2fa")]
    Primary2fa,
    DeviceManagementPortal,
}

impl fmt::Display for TargetSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSystem::Primary2fa => write!(f, "primary 2FA"),
            TargetSystem::DeviceManagementPortal => write!(f, "device management portal"),
        }
    }
}

/// Geographic coordinates and region derived for an event's source address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    /// State or province, when the lookup resolved one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// ISO 3166-1 alpha-2 country code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl GeoLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        GeoLocation {
            latitude,
            longitude,
            region: None,
            country: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// One normalized authentication attempt
///
/// Events are immutable once ingested. `sequence` is the ingestion order and
/// breaks ties between events sharing a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthEvent {
    pub sequence: u64,
    pub user: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    pub source_ip: Option<IpAddr>,
    /// Device or MAC identifier reported by the provider
    pub device: Option<String>,
    pub location: Option<GeoLocation>,
    pub target: TargetSystem,
}

impl AuthEvent {
    pub fn new(
        sequence: u64,
        user: impl Into<String>,
        timestamp: DateTime<Utc>,
        outcome: Outcome,
        target: TargetSystem,
    ) -> Self {
        AuthEvent {
            sequence,
            user: user.into(),
            timestamp,
            outcome,
            source_ip: None,
            device: None,
            location: None,
            target,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_location(mut self, location: GeoLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// True if the two events came from a different address or a different device
    pub fn differs_in_origin(&self, other: &AuthEvent) -> bool {
        self.source_ip != other.source_ip || self.device != other.device
    }

    /// Region of the event's location, if resolved
    pub fn region(&self) -> Option<&str> {
        self.location.as_ref().and_then(|l| l.region.as_deref())
    }

    /// Strict processing order: timestamp, then ingestion sequence
    pub fn chronological(a: &AuthEvent, b: &AuthEvent) -> Ordering {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.sequence.cmp(&b.sequence))
    }
}

/// Sort events into strict processing order
pub fn sort_chronologically(events: &mut [AuthEvent]) {
    events.sort_by(AuthEvent::chronological);
}

/// Half-open evaluation window `[start, end)`
///
/// `end` doubles as the evaluation time: account age and suppression
/// expiry are judged as of the end of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl EvaluationWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        EvaluationWindow { start, end }
    }

    /// Window of the given length ending at `end`
    pub fn ending_at(end: DateTime<Utc>, length: chrono::Duration) -> Self {
        EvaluationWindow {
            start: end - length,
            end,
        }
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// The same window extended backwards by `lookback`
    pub fn with_lookback(&self, lookback: chrono::Duration) -> Self {
        EvaluationWindow {
            start: self.start - lookback,
            end: self.end,
        }
    }
}
