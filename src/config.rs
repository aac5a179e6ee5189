use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::FindingKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the triage engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub eligibility: EligibilityConfig,
    pub detection: DetectionConfig,
    pub scoring: ScoringConfig,
    pub investigation: InvestigationConfig,
    pub pipeline: PipelineConfig,
}

/// Which users are considered for detection at all
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityConfig {
    /// Accounts younger than this many calendar months are skipped
    pub min_account_age_months: u32,
    /// Regions treated as the user's home in addition to their own
    pub home_equivalent_regions: Vec<String>,
}

/// Detector toggles and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub enable_fraud_report: bool,
    pub enable_failure_recovery: bool,
    pub enable_impossible_travel: bool,
    pub enable_dmp_failure: bool,
    /// A success this many minutes after a failure still counts as recovery
    pub recovery_window_minutes: i64,
    /// History fetched before the window start to seed the first travel pair
    pub travel_lookback_minutes: i64,
    /// VPN egress addresses; their geolocation is the concentrator, not the user
    pub vpn_addresses: Vec<IpAddr>,
    pub travel: TravelConfig,
}

/// Impossible travel thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TravelConfig {
    /// Pairs closer than this are never reported (GeoIP accuracy floor)
    pub min_distance_km: f64,
    /// Maximum plausible travel speed in km/h
    pub max_speed_kph: f64,
}

/// Severity weight per finding kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub fraud_report_weight: u32,
    pub impossible_travel_weight: u32,
    pub dmp_failure_weight: u32,
    pub failure_without_recovery_weight: u32,
}

/// Investigation state persistence and suppression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestigationConfig {
    /// SQLite database holding investigation records
    pub database_path: PathBuf,
    pub suppression_hours: i64,
}

/// Evaluation run scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Users evaluated concurrently
    pub max_concurrency: usize,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        EligibilityConfig {
            min_account_age_months: 6,
            home_equivalent_regions: Vec::new(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            enable_fraud_report: true,
            enable_failure_recovery: true,
            enable_impossible_travel: true,
            enable_dmp_failure: true,
            recovery_window_minutes: 30,
            // Half the Earth's circumference at 1000 km/h
            travel_lookback_minutes: 1201,
            vpn_addresses: Vec::new(),
            travel: TravelConfig::default(),
        }
    }
}

impl Default for TravelConfig {
    fn default() -> Self {
        TravelConfig {
            min_distance_km: 250.0,
            max_speed_kph: 1000.0,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        ScoringConfig {
            fraud_report_weight: 100,
            impossible_travel_weight: 10,
            dmp_failure_weight: 2,
            failure_without_recovery_weight: 1,
        }
    }
}

impl ScoringConfig {
    pub fn weight(&self, kind: FindingKind) -> u32 {
        match kind {
            FindingKind::FraudReport => self.fraud_report_weight,
            FindingKind::ImpossibleTravel => self.impossible_travel_weight,
            FindingKind::DmpFailure => self.dmp_failure_weight,
            FindingKind::FailureWithoutRecovery => self.failure_without_recovery_weight,
        }
    }
}

impl DetectionConfig {
    pub fn recovery_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.recovery_window_minutes)
    }
}

impl InvestigationConfig {
    pub fn suppression(&self) -> chrono::Duration {
        chrono::Duration::hours(self.suppression_hours)
    }
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        InvestigationConfig {
            database_path: PathBuf::from("duplex.db"),
            suppression_hours: 24,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig { max_concurrency: 8 }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject thresholds the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let detection = &self.detection;
        if detection.recovery_window_minutes <= 0 {
            return Err(ConfigError::Invalid(
                "detection.recovery_window_minutes must be positive".to_string(),
            ));
        }
        if detection.travel_lookback_minutes < 0 {
            return Err(ConfigError::Invalid(
                "detection.travel_lookback_minutes must not be negative".to_string(),
            ));
        }
        if !(detection.travel.min_distance_km >= 0.0) || !(detection.travel.max_speed_kph > 0.0) {
            return Err(ConfigError::Invalid(
                "detection.travel thresholds must be positive".to_string(),
            ));
        }

        let scoring = &self.scoring;
        let others = scoring
            .impossible_travel_weight
            .saturating_add(scoring.dmp_failure_weight)
            .saturating_add(scoring.failure_without_recovery_weight);
        if scoring.fraud_report_weight <= others {
            return Err(ConfigError::Invalid(format!(
                "scoring.fraud_report_weight ({}) must exceed the other weights combined ({})",
                scoring.fraud_report_weight, others
            )));
        }

        if self.investigation.suppression_hours <= 0 {
            return Err(ConfigError::Invalid(
                "investigation.suppression_hours must be positive".to_string(),
            ));
        }
        if self.pipeline.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn travel_lookback(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.detection.travel_lookback_minutes)
    }
}
