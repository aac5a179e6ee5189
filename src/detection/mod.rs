//! Detector set
//!
//! Every detector looks at one user's events independently; the set runs all
//! enabled detectors and concatenates their findings without deduplication.

pub mod dmp_failure;
pub mod failure_recovery;
pub mod fraud_report;
pub mod impossible_travel;

pub use dmp_failure::DmpFailureDetector;
pub use failure_recovery::FailureRecoveryDetector;
pub use fraud_report::FraudReportDetector;
pub use impossible_travel::{haversine_distance, ImpossibleTravelDetector};

use crate::config::{DetectionConfig, ScoringConfig};
use crate::models::{AuthEvent, EvaluationWindow, Finding, FindingKind, TravelDetails};

/// One user's events prepared for detection
///
/// `events` are in strict chronological order and may include lookback
/// history from before `window.start`. Only in-window events may be flagged.
pub struct DetectionContext<'a> {
    pub user: &'a str,
    pub events: &'a [AuthEvent],
    pub window: EvaluationWindow,
    pub scoring: &'a ScoringConfig,
}

impl<'a> DetectionContext<'a> {
    pub fn new(
        user: &'a str,
        events: &'a [AuthEvent],
        window: EvaluationWindow,
        scoring: &'a ScoringConfig,
    ) -> Self {
        DetectionContext {
            user,
            events,
            window,
            scoring,
        }
    }

    /// Events inside the evaluation window, with their index into `events`
    pub fn in_window(&self) -> impl Iterator<Item = (usize, &'a AuthEvent)> + '_ {
        self.events
            .iter()
            .enumerate()
            .filter(move |(_, e)| self.window.contains(e.timestamp))
    }

    pub(crate) fn finding(
        &self,
        kind: FindingKind,
        evidence: Vec<AuthEvent>,
        travel: Option<TravelDetails>,
        description: String,
    ) -> Finding {
        Finding {
            user: self.user.to_string(),
            kind,
            weight: self.scoring.weight(kind),
            evidence,
            detected_at: self.window.as_of(),
            travel,
            description,
        }
    }
}

pub trait Detector: Send + Sync {
    fn kind(&self) -> FindingKind;

    fn detect(&self, ctx: &DetectionContext<'_>) -> Vec<Finding>;
}

/// The enabled detectors, run side by side over the same events
pub struct DetectorSet {
    detectors: Vec<Box<dyn Detector>>,
}

impl DetectorSet {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        DetectorSet { detectors }
    }

    pub fn from_config(config: &DetectionConfig) -> Self {
        let mut detectors: Vec<Box<dyn Detector>> = Vec::with_capacity(4);
        if config.enable_fraud_report {
            detectors.push(Box::new(FraudReportDetector));
        }
        if config.enable_failure_recovery {
            detectors.push(Box::new(FailureRecoveryDetector::new(config.recovery_window())));
        }
        if config.enable_impossible_travel {
            detectors.push(Box::new(ImpossibleTravelDetector::new(
                config.travel.min_distance_km,
                config.travel.max_speed_kph,
                config.vpn_addresses.clone(),
            )));
        }
        if config.enable_dmp_failure {
            detectors.push(Box::new(DmpFailureDetector));
        }
        DetectorSet { detectors }
    }

    pub fn kinds(&self) -> Vec<FindingKind> {
        self.detectors.iter().map(|d| d.kind()).collect()
    }

    pub fn run(&self, ctx: &DetectionContext<'_>) -> Vec<Finding> {
        let mut findings = Vec::new();
        for detector in &self.detectors {
            let found = detector.detect(ctx);
            if !found.is_empty() {
                log::debug!(
                    "{} produced {} finding(s) for '{}'",
                    detector.kind(),
                    found.len(),
                    ctx.user
                );
            }
            findings.extend(found);
        }
        findings
    }
}

impl Default for DetectorSet {
    fn default() -> Self {
        Self::from_config(&DetectionConfig::default())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::models::{Outcome, TargetSystem};

    #[test]
    fn test_set_accumulates_across_kinds() {
        let scoring = ScoringConfig::default();
        // A DMP failure that is never recovered counts twice
        let events = vec![{
            let mut e = event(0, at(10, 0), Outcome::Failure);
            e.target = TargetSystem::DeviceManagementPortal;
            e
        }];
        let window = EvaluationWindow::new(at(0, 0), at(23, 0));
        let ctx = DetectionContext::new("alice", &events, window, &scoring);

        let findings = DetectorSet::default().run(&ctx);
        let kinds: Vec<FindingKind> = findings.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![FindingKind::FailureWithoutRecovery, FindingKind::DmpFailure]
        );
        assert!(findings.iter().all(|f| f.detected_at == window.end));
    }

    #[test]
    fn test_disabled_detectors_are_skipped() {
        let config = DetectionConfig {
            enable_failure_recovery: false,
            enable_impossible_travel: false,
            ..DetectionConfig::default()
        };
        let set = DetectorSet::from_config(&config);
        assert_eq!(
            set.kinds(),
            vec![FindingKind::FraudReport, FindingKind::DmpFailure]
        );
    }

    #[test]
    fn test_lookback_events_are_not_flagged() {
        let scoring = ScoringConfig::default();
        let events = vec![
            event(0, at(1, 0), Outcome::FraudReport),
            event(1, at(5, 0), Outcome::Failure),
        ];
        let window = EvaluationWindow::new(at(4, 0), at(23, 0));
        let ctx = DetectionContext::new("alice", &events, window, &scoring);

        let findings = DetectorSet::default().run(&ctx);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::FailureWithoutRecovery);
    }
}
