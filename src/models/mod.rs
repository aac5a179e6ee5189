pub mod event;
pub mod finding;
pub mod investigation;
pub mod profile;

pub use event::{
    sort_chronologically, AuthEvent, EvaluationWindow, GeoLocation, Outcome, TargetSystem,
};
pub use finding::{Finding, FindingKind, TravelDetails, UserVerdict};
pub use investigation::{InvestigationRecord, InvestigationStatus};
pub use profile::UserProfile;
