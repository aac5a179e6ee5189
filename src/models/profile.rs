use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account metadata from the asset/helpdesk system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user: String,
    pub created_at: DateTime<Utc>,
    /// Home state or region; the helpdesk does not always have one
    pub home_region: Option<String>,
}

impl UserProfile {
    pub fn new(user: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        UserProfile {
            user: user.into(),
            created_at,
            home_region: None,
        }
    }

    pub fn with_home_region(mut self, region: impl Into<String>) -> Self {
        self.home_region = Some(region.into());
        self
    }
}
