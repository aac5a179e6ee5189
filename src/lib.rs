pub mod config;
pub mod detection;
pub mod eligibility;
pub mod engine;
pub mod geolocation;
pub mod hooks;
pub mod ingest;
pub mod investigation;
pub mod models;
pub mod persistence;
pub mod scoring;
pub mod sources;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use detection::{Detector, DetectorSet};
pub use engine::{Engine, EngineError, EvaluationReport, RunSummary, RunWarning, UserFailure};
pub use geolocation::{GeoIpService, Geolocator};
pub use hooks::{InvestigationEvent, TicketHook};
pub use ingest::EventParser;
pub use investigation::InvestigationTracker;
pub use models::{
    AuthEvent, EvaluationWindow, Finding, FindingKind, InvestigationRecord, InvestigationStatus,
    Outcome, TargetSystem, UserProfile, UserVerdict,
};
pub use persistence::{InvestigationStore, SqliteInvestigationStore};
pub use sources::{AuthLogSource, ProfileSource};
