use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationStatus {
    None,
    Open,
    Investigated,
}

impl InvestigationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestigationStatus::None => "none",
            InvestigationStatus::Open => "open",
            InvestigationStatus::Investigated => "investigated",
        }
    }
}

impl fmt::Display for InvestigationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for InvestigationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(InvestigationStatus::None),
            "open" => Ok(InvestigationStatus::Open),
            "investigated" => Ok(InvestigationStatus::Investigated),
            other => Err(format!("unknown investigation status: {}", other)),
        }
    }
}

/// Per-user suppression state, the only state kept across runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestigationRecord {
    pub user: String,
    pub status: InvestigationStatus,
    /// When the ticketing system opened a ticket for the user
    pub opened_at: Option<DateTime<Utc>>,
    pub marked_at: Option<DateTime<Utc>>,
    pub suppress_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Instants are kept to the millisecond, the precision of the state store
fn stored_instant(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}

impl InvestigationRecord {
    pub fn opened(user: impl Into<String>, at: DateTime<Utc>) -> Self {
        let at = stored_instant(at);
        InvestigationRecord {
            user: user.into(),
            status: InvestigationStatus::Open,
            opened_at: Some(at),
            marked_at: None,
            suppress_until: None,
            updated_at: at,
        }
    }

    pub fn investigated(
        user: impl Into<String>,
        marked_at: DateTime<Utc>,
        suppression: Duration,
    ) -> Self {
        let marked_at = stored_instant(marked_at);
        InvestigationRecord {
            user: user.into(),
            status: InvestigationStatus::Investigated,
            opened_at: None,
            marked_at: Some(marked_at),
            suppress_until: Some(marked_at + suppression),
            updated_at: marked_at,
        }
    }

    /// Status as seen at `now`
    ///
    /// An investigated record whose suppression ended at or before `now`
    /// reads as `None`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> InvestigationStatus {
        match (self.status, self.suppress_until) {
            (InvestigationStatus::Investigated, Some(until)) if now >= until => {
                InvestigationStatus::None
            }
            (status, _) => status,
        }
    }

    pub fn is_suppressed(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == InvestigationStatus::Investigated
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == InvestigationStatus::Investigated && !self.is_suppressed(now)
    }
}
