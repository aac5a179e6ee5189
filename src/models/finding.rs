use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::event::AuthEvent;

/// Detector that produced a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    FraudReport,
    FailureWithoutRecovery,
    ImpossibleTravel,
    DmpFailure,
}

impl FindingKind {
    pub const ALL: [FindingKind; 4] = [
        FindingKind::FraudReport,
        FindingKind::FailureWithoutRecovery,
        FindingKind::ImpossibleTravel,
        FindingKind::DmpFailure,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FindingKind::FraudReport => "Fraud Report",
            FindingKind::FailureWithoutRecovery => "Failure Without Recovery",
            FindingKind::ImpossibleTravel => "Impossible Travel",
            FindingKind::DmpFailure => "Device Management Portal Failure",
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Measurements behind an impossible-travel finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TravelDetails {
    pub distance_km: f64,
    pub elapsed_seconds: f64,
    pub speed_kph: f64,
}

/// One detected anomaly attributed to a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub user: String,
    pub kind: FindingKind,
    pub weight: u32,
    /// Contributing events in chronological order
    pub evidence: Vec<AuthEvent>,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub travel: Option<TravelDetails>,
    pub description: String,
}

impl Finding {
    /// Earliest contributing event
    pub fn first_evidence(&self) -> Option<&AuthEvent> {
        self.evidence
            .iter()
            .min_by(|a, b| AuthEvent::chronological(a, b))
    }

    pub fn earliest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.first_evidence().map(|e| e.timestamp)
    }
}

/// Scored and ranked summary of one user's findings for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserVerdict {
    pub user: String,
    pub score: u32,
    pub findings: Vec<Finding>,
    /// 1-based position in the delivered output
    pub rank: usize,
}

impl UserVerdict {
    pub fn has_fraud(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.kind == FindingKind::FraudReport)
    }

    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }

    pub fn earliest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.findings
            .iter()
            .filter_map(|f| f.earliest_timestamp())
            .min()
    }
}
