//! Evaluation pipeline
//!
//! `evaluate` runs one window end to end: users are evaluated in parallel
//! (fetch, eligibility, detection, scoring), the verdicts are sorted into
//! review order, the investigation tracker drops suppressed users and the
//! survivors are ranked. Per-user failures are isolated and reported; only
//! run-level failures abort the run.

use chrono::Duration;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError, ScoringConfig};
use crate::detection::{DetectionContext, DetectorSet};
use crate::eligibility::EligibilityFilter;
use crate::hooks::TicketHook;
use crate::investigation::{InvestigationTracker, TrackerError};
use crate::models::{
    sort_chronologically, AuthEvent, EvaluationWindow, InvestigationRecord, InvestigationStatus,
    UserVerdict,
};
use crate::persistence::{InvestigationStore, PersistenceError, SqliteInvestigationStore};
use crate::scoring;
use crate::sources::{AuthLogSource, ProfileSource, SourceError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Investigation store unavailable: {0}")]
    StateStoreUnavailable(#[source] PersistenceError),

    #[error("Failed to list users: {0}")]
    UserListing(#[source] SourceError),

    #[error("Evaluation task failed: {0}")]
    TaskFailed(String),

    #[error("Evaluation cancelled")]
    Cancelled,
}

/// Step at which a single user's evaluation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Events,
    Profile,
    StateStore,
    Scheduling,
}

/// A user left out of the run because of an error, never silently
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserFailure {
    pub user: String,
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum RunWarning {
    /// No profile: evaluated without eligibility rules
    MissingProfile { user: String },
    /// The user's investigation record changed while the run was in flight;
    /// the fresh record was applied
    ConcurrentMark {
        user: String,
        before: InvestigationStatus,
        after: InvestigationStatus,
    },
}

impl RunWarning {
    pub fn user(&self) -> &str {
        match self {
            RunWarning::MissingProfile { user } | RunWarning::ConcurrentMark { user, .. } => user,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub users_seen: usize,
    pub ineligible: usize,
    /// Users delivered in `verdicts`
    pub flagged: usize,
    /// Users with findings withheld by an active investigation
    pub suppressed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub window: EvaluationWindow,
    /// Ranked review queue, highest priority first
    pub verdicts: Vec<UserVerdict>,
    pub failures: Vec<UserFailure>,
    pub warnings: Vec<RunWarning>,
    pub summary: RunSummary,
}

impl EvaluationReport {
    /// True if some users could not be evaluated
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

enum UserOutcome {
    Flagged {
        verdict: UserVerdict,
        snapshot: Option<InvestigationRecord>,
        warnings: Vec<RunWarning>,
    },
    Clean {
        user: String,
        warnings: Vec<RunWarning>,
    },
    Ineligible {
        user: String,
    },
    Failed(UserFailure),
}

impl UserOutcome {
    fn user(&self) -> &str {
        match self {
            UserOutcome::Flagged { verdict, .. } => &verdict.user,
            UserOutcome::Clean { user, .. } | UserOutcome::Ineligible { user } => user,
            UserOutcome::Failed(failure) => &failure.user,
        }
    }
}

fn user_failure(user: &str, stage: FailureStage, error: impl std::fmt::Display) -> UserFailure {
    log::error!("Evaluation of '{}' failed at {:?}: {}", user, stage, error);
    UserFailure {
        user: user.to_string(),
        stage,
        message: error.to_string(),
    }
}

fn failure(user: &str, stage: FailureStage, error: impl std::fmt::Display) -> UserOutcome {
    UserOutcome::Failed(user_failure(user, stage, error))
}

/// Everything a per-user task needs, shared across tasks
struct UserEvaluator {
    logs: Arc<dyn AuthLogSource>,
    profiles: Arc<dyn ProfileSource>,
    tracker: Arc<InvestigationTracker>,
    detectors: DetectorSet,
    eligibility: EligibilityFilter,
    scoring: ScoringConfig,
    lookback: Duration,
}

impl UserEvaluator {
    async fn evaluate(&self, user: String, window: EvaluationWindow) -> UserOutcome {
        let mut events = match self
            .logs
            .events_for_user(&user, window.with_lookback(self.lookback))
            .await
        {
            Ok(events) => events,
            Err(e) => return failure(&user, FailureStage::Events, e),
        };
        events.retain(|e| e.user == user);
        sort_chronologically(&mut events);

        let snapshot = match self.tracker.record(&user) {
            Ok(record) => record,
            Err(e) => return failure(&user, FailureStage::StateStore, e),
        };

        let profile = match self.profiles.profile(&user).await {
            Ok(profile) => profile,
            Err(e) => return failure(&user, FailureStage::Profile, e),
        };

        let mut warnings = Vec::new();
        match profile {
            Some(profile) => {
                let in_window: Vec<AuthEvent> = events
                    .iter()
                    .filter(|e| window.contains(e.timestamp))
                    .cloned()
                    .collect();
                let exclusion = self
                    .eligibility
                    .exclusion(&profile, &in_window, window.as_of());
                if let Some(reason) = exclusion {
                    log::debug!("'{}' is not eligible: {:?}", user, reason);
                    return UserOutcome::Ineligible { user };
                }
            }
            None => {
                log::warn!("No profile for '{}', evaluating without eligibility rules", user);
                warnings.push(RunWarning::MissingProfile { user: user.clone() });
            }
        }

        let ctx = DetectionContext::new(&user, &events, window, &self.scoring);
        let findings = self.detectors.run(&ctx);
        match scoring::verdict(user.as_str(), findings) {
            Some(verdict) => UserOutcome::Flagged {
                verdict,
                snapshot,
                warnings,
            },
            None => UserOutcome::Clean { user, warnings },
        }
    }
}

pub struct Engine {
    config: Config,
    evaluator: Arc<UserEvaluator>,
}

impl Engine {
    pub fn new(
        config: Config,
        logs: Arc<dyn AuthLogSource>,
        profiles: Arc<dyn ProfileSource>,
        tracker: Arc<InvestigationTracker>,
    ) -> Result<Self, EngineError> {
        let detectors = DetectorSet::from_config(&config.detection);
        Self::with_detectors(config, logs, profiles, tracker, detectors)
    }

    pub fn with_detectors(
        config: Config,
        logs: Arc<dyn AuthLogSource>,
        profiles: Arc<dyn ProfileSource>,
        tracker: Arc<InvestigationTracker>,
        detectors: DetectorSet,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let evaluator = UserEvaluator {
            logs,
            profiles,
            tracker,
            detectors,
            eligibility: EligibilityFilter::new(
                &config.eligibility,
                &config.detection.vpn_addresses,
            ),
            scoring: config.scoring.clone(),
            lookback: config.travel_lookback(),
        };
        Ok(Engine {
            config,
            evaluator: Arc::new(evaluator),
        })
    }

    /// Engine backed by the SQLite store named in the configuration
    pub fn open(
        config: Config,
        logs: Arc<dyn AuthLogSource>,
        profiles: Arc<dyn ProfileSource>,
    ) -> Result<Self, EngineError> {
        let store = SqliteInvestigationStore::new(&config.investigation.database_path)
            .map_err(EngineError::StateStoreUnavailable)?;
        let store: Arc<dyn InvestigationStore> = Arc::new(store);
        let tracker = InvestigationTracker::from_config(store, &config.investigation);
        Self::new(config, logs, profiles, Arc::new(tracker))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<InvestigationTracker> {
        &self.evaluator.tracker
    }

    /// Hook for the ticketing system to report new tickets
    pub fn ticket_hook(&self) -> Arc<dyn TicketHook> {
        self.evaluator.tracker.clone()
    }

    pub fn mark_investigated(
        &self,
        user: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<InvestigationRecord, TrackerError> {
        self.evaluator.tracker.mark_investigated(user, at)
    }

    pub async fn evaluate(&self, window: EvaluationWindow) -> Result<EvaluationReport, EngineError> {
        self.evaluate_with_cancel(window, &CancellationToken::new())
            .await
    }

    /// Evaluate `window`, giving up with `EngineError::Cancelled` as soon as
    /// `cancel` fires; no partial results are returned
    pub async fn evaluate_with_cancel(
        &self,
        window: EvaluationWindow,
        cancel: &CancellationToken,
    ) -> Result<EvaluationReport, EngineError> {
        log::info!(
            "Evaluating window {} .. {}",
            window.start.to_rfc3339(),
            window.end.to_rfc3339()
        );

        self.evaluator
            .tracker
            .store()
            .ping()
            .map_err(EngineError::StateStoreUnavailable)?;

        let mut users = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.cancelled()),
            users = self.evaluator.logs.users_in_window(window) => {
                users.map_err(EngineError::UserListing)?
            }
        };
        users.sort();
        users.dedup();

        let outcomes = self.run_users(&users, window, cancel).await?;
        Ok(self.finalize(window, users.len(), outcomes))
    }

    fn cancelled(&self) -> EngineError {
        log::warn!("Evaluation cancelled, discarding partial results");
        EngineError::Cancelled
    }

    async fn run_users(
        &self,
        users: &[String],
        window: EvaluationWindow,
        cancel: &CancellationToken,
    ) -> Result<Vec<UserOutcome>, EngineError> {
        let semaphore = Arc::new(Semaphore::new(self.config.pipeline.max_concurrency));
        let mut tasks = JoinSet::new();

        for user in users {
            let user = user.clone();
            let evaluator = Arc::clone(&self.evaluator);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return failure(&user, FailureStage::Scheduling, e),
                };
                evaluator.evaluate(user, window).await
            });
        }

        let mut outcomes = Vec::with_capacity(users.len());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(self.cancelled());
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(outcome)) => outcomes.push(outcome),
                    Some(Err(e)) => {
                        tasks.abort_all();
                        log::error!("Evaluation task failed: {}", e);
                        return Err(EngineError::TaskFailed(e.to_string()));
                    }
                    None => break,
                },
            }
        }

        // Completion order is arbitrary
        outcomes.sort_by(|a, b| a.user().cmp(b.user()));
        Ok(outcomes)
    }

    fn finalize(
        &self,
        window: EvaluationWindow,
        users_seen: usize,
        outcomes: Vec<UserOutcome>,
    ) -> EvaluationReport {
        let as_of = window.as_of();
        let mut summary = RunSummary {
            users_seen,
            ..RunSummary::default()
        };
        let mut failures = Vec::new();
        let mut warnings = Vec::new();
        let mut candidates = Vec::new();
        let mut snapshots = HashMap::new();

        for outcome in outcomes {
            match outcome {
                UserOutcome::Flagged {
                    verdict,
                    snapshot,
                    warnings: w,
                } => {
                    warnings.extend(w);
                    snapshots.insert(verdict.user.clone(), snapshot);
                    candidates.push(verdict);
                }
                UserOutcome::Clean { warnings: w, .. } => warnings.extend(w),
                UserOutcome::Ineligible { .. } => summary.ineligible += 1,
                UserOutcome::Failed(f) => failures.push(f),
            }
        }

        scoring::sort_verdicts(&mut candidates);

        // Last stage: re-read every flagged user's record so that marks made
        // during the run are honoured
        let mut verdicts = Vec::with_capacity(candidates.len());
        for verdict in candidates {
            let snapshot = snapshots.remove(&verdict.user).flatten();
            let fresh = match self.evaluator.tracker.record(&verdict.user) {
                Ok(fresh) => fresh,
                Err(e) => {
                    failures.push(user_failure(&verdict.user, FailureStage::StateStore, e));
                    continue;
                }
            };

            if fresh != snapshot {
                let status = |r: &Option<InvestigationRecord>| {
                    r.as_ref()
                        .map(|r| r.effective_status(as_of))
                        .unwrap_or(InvestigationStatus::None)
                };
                log::warn!(
                    "Investigation record for '{}' changed during the run, using the latest",
                    verdict.user
                );
                warnings.push(RunWarning::ConcurrentMark {
                    user: verdict.user.clone(),
                    before: status(&snapshot),
                    after: status(&fresh),
                });
            }

            if fresh.map(|r| r.is_suppressed(as_of)).unwrap_or(false) {
                log::debug!("'{}' suppressed by an active investigation", verdict.user);
                summary.suppressed += 1;
                continue;
            }
            verdicts.push(verdict);
        }

        scoring::assign_ranks(&mut verdicts);
        summary.flagged = verdicts.len();
        summary.failed = failures.len();

        log::info!(
            "Evaluation finished: {} user(s) seen, {} ineligible, {} flagged, {} suppressed, {} failed",
            summary.users_seen,
            summary.ineligible,
            summary.flagged,
            summary.suppressed,
            summary.failed
        );
        for (kind, count) in scoring::kind_counts(&verdicts) {
            if count > 0 {
                log::debug!("{}: {} finding(s)", kind, count);
            }
        }

        EvaluationReport {
            window,
            verdicts,
            failures,
            warnings,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FindingKind, GeoLocation, Outcome, TargetSystem, UserProfile};
    use crate::persistence::RecordUpdate;
    use crate::sources::{InMemoryLogSource, InMemoryProfileSource};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LA: (f64, f64) = (34.0522, -118.2437);
    const NYC: (f64, f64) = (40.7128, -74.0060);

    fn ts(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0).unwrap()
    }

    fn march_1() -> EvaluationWindow {
        EvaluationWindow::new(ts(1, 0, 0), ts(2, 0, 0))
    }

    fn veteran(user: &str, home: &str) -> UserProfile {
        UserProfile::new(user, Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap())
            .with_home_region(home)
    }

    fn event(seq: u64, user: &str, time: DateTime<Utc>, outcome: Outcome) -> AuthEvent {
        AuthEvent::new(seq, user, time, outcome, TargetSystem::Primary2fa)
    }

    fn located(
        seq: u64,
        user: &str,
        time: DateTime<Utc>,
        outcome: Outcome,
        ip: &str,
        (lat, lon): (f64, f64),
        region: &str,
    ) -> AuthEvent {
        event(seq, user, time, outcome)
            .with_ip(ip.parse().unwrap())
            .with_location(GeoLocation::new(lat, lon).with_region(region))
    }

    /// Failure in California, success in New York an hour later
    fn coast_to_coast(user: &str) -> Vec<AuthEvent> {
        vec![
            located(0, user, ts(1, 10, 0), Outcome::Failure, "1.1.1.1", LA, "CA"),
            located(1, user, ts(1, 11, 0), Outcome::Success, "2.2.2.2", NYC, "New York"),
        ]
    }

    fn memory_store() -> Arc<dyn InvestigationStore> {
        Arc::new(SqliteInvestigationStore::in_memory().unwrap())
    }

    fn engine_with(
        logs: impl AuthLogSource + 'static,
        profiles: impl ProfileSource + 'static,
        store: Arc<dyn InvestigationStore>,
    ) -> Engine {
        let tracker = InvestigationTracker::new(store, Duration::hours(24));
        Engine::new(
            Config::default(),
            Arc::new(logs),
            Arc::new(profiles),
            Arc::new(tracker),
        )
        .unwrap()
    }

    fn engine(events: Vec<AuthEvent>, profiles: Vec<UserProfile>) -> Engine {
        engine_with(
            InMemoryLogSource::from_events(events),
            InMemoryProfileSource::from_profiles(profiles),
            memory_store(),
        )
    }

    fn users(report: &EvaluationReport) -> Vec<&str> {
        report.verdicts.iter().map(|v| v.user.as_str()).collect()
    }

    #[tokio::test]
    async fn test_established_account_coast_to_coast() {
        let engine = engine(coast_to_coast("u"), vec![veteran("u", "CA")]);
        let report = engine.evaluate(march_1()).await.unwrap();

        assert_eq!(report.verdicts.len(), 1);
        let verdict = &report.verdicts[0];
        assert_eq!(verdict.rank, 1);
        let kinds: Vec<FindingKind> = verdict.findings.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![FindingKind::FailureWithoutRecovery, FindingKind::ImpossibleTravel]
        );
        assert_eq!(verdict.score, 11);
        assert!(!report.is_partial());
    }

    #[tokio::test]
    async fn test_new_account_is_ineligible() {
        let created = ts(1, 0, 0) - chrono::Months::new(3);
        let profile = UserProfile::new("u", created).with_home_region("CA");
        let engine = engine(coast_to_coast("u"), vec![profile]);

        let report = engine.evaluate(march_1()).await.unwrap();
        assert!(report.verdicts.is_empty());
        assert_eq!(report.summary.ineligible, 1);
        assert_eq!(report.summary.users_seen, 1);
    }

    #[tokio::test]
    async fn test_home_region_only_is_ineligible() {
        let events = vec![
            located(0, "u", ts(1, 10, 0), Outcome::Failure, "1.1.1.1", LA, "California"),
            located(1, "u", ts(1, 12, 0), Outcome::Failure, "1.1.1.1", LA, "CA"),
        ];
        let engine = engine(events, vec![veteran("u", "CA")]);
        let report = engine.evaluate(march_1()).await.unwrap();
        assert!(report.verdicts.is_empty());
        assert_eq!(report.summary.ineligible, 1);
    }

    #[tokio::test]
    async fn test_suppression_expires_after_24_hours() {
        let window_for =
            |end: DateTime<Utc>| EvaluationWindow::ending_at(end, Duration::hours(24));
        let events = vec![event(
            0,
            "v",
            Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap(),
            Outcome::FraudReport,
        )];
        let engine = engine(events, vec![veteran("v", "SC")]);
        engine
            .mark_investigated("v", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .unwrap();

        let report = engine
            .evaluate(window_for(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()))
            .await
            .unwrap();
        assert!(report.verdicts.is_empty());
        assert_eq!(report.summary.suppressed, 1);

        let report = engine
            .evaluate(window_for(Utc.with_ymd_and_hms(2024, 1, 2, 1, 0, 0).unwrap()))
            .await
            .unwrap();
        assert_eq!(users(&report), vec!["v"]);
    }

    #[tokio::test]
    async fn test_fraud_ranks_first_and_ranks_are_contiguous() {
        let mut events = Vec::new();
        // "traveler" bounces between coasts every hour: 11 travel findings
        for i in 0..12u64 {
            let (ip, coords, region) = if i % 2 == 0 {
                ("1.1.1.1", LA, "California")
            } else {
                ("2.2.2.2", NYC, "New York")
            };
            let time = ts(1, 1 + i as u32, 0);
            events.push(located(i, "traveler", time, Outcome::Success, ip, coords, region));
        }
        events.push(event(20, "fraudster", ts(1, 20, 0), Outcome::FraudReport));
        events.push(event(21, "quiet", ts(1, 9, 0), Outcome::FraudReport));
        events.push(event(22, "marked", ts(1, 8, 0), Outcome::FraudReport));

        let engine = engine(
            events,
            vec![
                veteran("traveler", "SC"),
                veteran("fraudster", "SC"),
                veteran("quiet", "SC"),
                veteran("marked", "SC"),
            ],
        );
        engine.mark_investigated("marked", ts(1, 12, 0)).unwrap();

        let report = engine.evaluate(march_1()).await.unwrap();
        // Equal fraud scores fall back to the earliest evidence
        assert_eq!(users(&report), vec!["quiet", "fraudster", "traveler"]);
        let ranks: Vec<usize> = report.verdicts.iter().map(|v| v.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert!(report.verdicts[2].score > report.verdicts[0].score);
        assert_eq!(report.summary.suppressed, 1);
    }

    #[tokio::test]
    async fn test_evaluation_is_deterministic() {
        let mut events = coast_to_coast("a");
        events.extend(coast_to_coast("b").into_iter().map(|mut e| {
            e.sequence += 10;
            e
        }));
        events.push(event(20, "c", ts(1, 3, 0), Outcome::FraudReport));
        let profiles = vec![veteran("a", "CA"), veteran("b", "CA"), veteran("c", "CA")];

        let first = engine(events.clone(), profiles.clone())
            .evaluate(march_1())
            .await
            .unwrap();
        let second = engine(events, profiles).evaluate(march_1()).await.unwrap();

        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(users(&first), vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_missing_profile_warns_and_evaluates() {
        let engine = engine(coast_to_coast("ghost"), Vec::new());
        let report = engine.evaluate(march_1()).await.unwrap();

        assert_eq!(users(&report), vec!["ghost"]);
        assert_eq!(
            report.warnings,
            vec![RunWarning::MissingProfile {
                user: "ghost".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_lookback_event_pairs_with_first_in_window_event() {
        let events = vec![
            located(0, "u", ts(1, 23, 30), Outcome::Success, "1.1.1.1", LA, "California"),
            located(1, "u", ts(2, 0, 30), Outcome::Success, "2.2.2.2", NYC, "New York"),
        ];
        let engine = engine(events, vec![veteran("u", "SC")]);
        let report = engine
            .evaluate(EvaluationWindow::new(ts(2, 0, 0), ts(3, 0, 0)))
            .await
            .unwrap();

        assert_eq!(report.verdicts.len(), 1);
        assert_eq!(
            report.verdicts[0].findings[0].kind,
            FindingKind::ImpossibleTravel
        );
    }

    /// Store double that fails on demand
    struct FlakyStore {
        inner: SqliteInvestigationStore,
        fail_ping: bool,
        fail_user: Option<&'static str>,
    }

    impl FlakyStore {
        fn new(fail_ping: bool, fail_user: Option<&'static str>) -> Self {
            FlakyStore {
                inner: SqliteInvestigationStore::in_memory().unwrap(),
                fail_ping,
                fail_user,
            }
        }
    }

    impl InvestigationStore for FlakyStore {
        fn ping(&self) -> Result<(), PersistenceError> {
            if self.fail_ping {
                return Err(PersistenceError::Unavailable("down".to_string()));
            }
            self.inner.ping()
        }

        fn get_record(&self, user: &str) -> Result<Option<InvestigationRecord>, PersistenceError> {
            if self.fail_user == Some(user) {
                return Err(PersistenceError::Unavailable("read timed out".to_string()));
            }
            self.inner.get_record(user)
        }

        fn put_record(&self, record: &InvestigationRecord) -> Result<(), PersistenceError> {
            self.inner.put_record(record)
        }

        fn delete_record(&self, user: &str) -> Result<bool, PersistenceError> {
            self.inner.delete_record(user)
        }

        fn update_record(
            &self,
            user: &str,
            update: RecordUpdate<'_>,
        ) -> Result<Option<InvestigationRecord>, PersistenceError> {
            self.inner.update_record(user, update)
        }

        fn list_records(&self) -> Result<Vec<InvestigationRecord>, PersistenceError> {
            self.inner.list_records()
        }

        fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, PersistenceError> {
            self.inner.prune_expired(now)
        }

        fn clear_all(&self) -> Result<(), PersistenceError> {
            self.inner.clear_all()
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_aborts_run() {
        let engine = engine_with(
            InMemoryLogSource::from_events(coast_to_coast("u")),
            InMemoryProfileSource::from_profiles(vec![veteran("u", "CA")]),
            Arc::new(FlakyStore::new(true, None)),
        );
        assert!(matches!(
            engine.evaluate(march_1()).await,
            Err(EngineError::StateStoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_per_user_store_failure_is_reported() {
        let mut events = coast_to_coast("ok");
        events.extend(coast_to_coast("broken").into_iter().map(|mut e| {
            e.sequence += 10;
            e
        }));
        let engine = engine_with(
            InMemoryLogSource::from_events(events),
            InMemoryProfileSource::from_profiles(vec![
                veteran("ok", "CA"),
                veteran("broken", "CA"),
            ]),
            Arc::new(FlakyStore::new(false, Some("broken"))),
        );

        let report = engine.evaluate(march_1()).await.unwrap();
        assert_eq!(users(&report), vec!["ok"]);
        assert!(report.is_partial());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].user, "broken");
        assert_eq!(report.failures[0].stage, FailureStage::StateStore);
        assert_eq!(report.summary.failed, 1);
    }

    /// Profile source that marks the user while the run is in flight
    struct MarkingProfiles {
        inner: InMemoryProfileSource,
        tracker: Arc<InvestigationTracker>,
    }

    #[async_trait]
    impl ProfileSource for MarkingProfiles {
        async fn profile(&self, user: &str) -> Result<Option<UserProfile>, SourceError> {
            self.tracker
                .mark_investigated(user, ts(1, 12, 0))
                .map_err(|e| SourceError::Profiles(e.to_string()))?;
            self.inner.profile(user).await
        }
    }

    #[tokio::test]
    async fn test_mark_during_run_wins_with_warning() {
        let tracker = Arc::new(InvestigationTracker::new(memory_store(), Duration::hours(24)));
        let profiles = MarkingProfiles {
            inner: InMemoryProfileSource::from_profiles(vec![veteran("u", "CA")]),
            tracker: Arc::clone(&tracker),
        };
        let engine = Engine::new(
            Config::default(),
            Arc::new(InMemoryLogSource::from_events(coast_to_coast("u"))),
            Arc::new(profiles),
            tracker,
        )
        .unwrap();

        let report = engine.evaluate(march_1()).await.unwrap();
        assert!(report.verdicts.is_empty());
        assert_eq!(report.summary.suppressed, 1);
        assert_eq!(
            report.warnings,
            vec![RunWarning::ConcurrentMark {
                user: "u".to_string(),
                before: InvestigationStatus::None,
                after: InvestigationStatus::Investigated,
            }]
        );
    }

    /// Log source whose per-user fetch never completes
    /// Delays every fetch and records the most fetches seen in flight at once
    struct CountingLogs {
        inner: InMemoryLogSource,
        in_flight: AtomicUsize,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AuthLogSource for CountingLogs {
        async fn users_in_window(
            &self,
            window: EvaluationWindow,
        ) -> Result<Vec<String>, SourceError> {
            self.inner.users_in_window(window).await
        }

        async fn events_for_user(
            &self,
            user: &str,
            window: EvaluationWindow,
        ) -> Result<Vec<AuthEvent>, SourceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.events_for_user(user, window).await
        }
    }

    #[tokio::test]
    async fn test_max_concurrency_bounds_user_evaluation() {
        let names: Vec<String> = (0..6).map(|i| format!("user{}", i)).collect();
        let events = names
            .iter()
            .enumerate()
            .map(|(i, name)| event(i as u64, name, ts(1, 9, 0), Outcome::FraudReport));
        let peak = Arc::new(AtomicUsize::new(0));
        let logs = CountingLogs {
            inner: InMemoryLogSource::from_events(events),
            in_flight: AtomicUsize::new(0),
            peak: Arc::clone(&peak),
        };
        let profiles =
            InMemoryProfileSource::from_profiles(names.iter().map(|name| veteran(name, "SC")));

        let mut config = Config::default();
        config.pipeline.max_concurrency = 2;
        let tracker = InvestigationTracker::new(memory_store(), Duration::hours(24));
        let engine = Engine::new(config, Arc::new(logs), Arc::new(profiles), Arc::new(tracker))
            .unwrap();

        let report = engine.evaluate(march_1()).await.unwrap();
        assert_eq!(report.verdicts.len(), 6);
        assert!(!report.is_partial());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    struct StalledLogs;

    #[async_trait]
    impl AuthLogSource for StalledLogs {
        async fn users_in_window(&self, _: EvaluationWindow) -> Result<Vec<String>, SourceError> {
            Ok(vec!["u".to_string()])
        }

        async fn events_for_user(
            &self,
            _: &str,
            _: EvaluationWindow,
        ) -> Result<Vec<AuthEvent>, SourceError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancellation_discards_run() {
        let engine = engine_with(StalledLogs, InMemoryProfileSource::new(), memory_store());

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        assert!(matches!(
            engine.evaluate_with_cancel(march_1(), &token).await,
            Err(EngineError::Cancelled)
        ));

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            engine.evaluate_with_cancel(march_1(), &token).await,
            Err(EngineError::Cancelled)
        ));
    }

    struct FailingLogs;

    #[async_trait]
    impl AuthLogSource for FailingLogs {
        async fn users_in_window(&self, _: EvaluationWindow) -> Result<Vec<String>, SourceError> {
            Err(SourceError::Logs("index offline".to_string()))
        }

        async fn events_for_user(
            &self,
            _: &str,
            _: EvaluationWindow,
        ) -> Result<Vec<AuthEvent>, SourceError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_user_listing_failure_is_fatal() {
        let engine = engine_with(FailingLogs, InMemoryProfileSource::new(), memory_store());
        assert!(matches!(
            engine.evaluate(march_1()).await,
            Err(EngineError::UserListing(_))
        ));
    }

    #[tokio::test]
    async fn test_ticket_hook_opens_ticket_without_suppressing() {
        let engine = engine(coast_to_coast("u"), vec![veteran("u", "CA")]);
        engine.ticket_hook().ticket_created("u", ts(1, 9, 0)).unwrap();

        assert_eq!(
            engine.tracker().status("u", ts(2, 0, 0)).unwrap(),
            InvestigationStatus::Open
        );
        let report = engine.evaluate(march_1()).await.unwrap();
        assert_eq!(users(&report), vec!["u"]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.pipeline.max_concurrency = 0;
        let tracker = InvestigationTracker::new(memory_store(), Duration::hours(24));
        let result = Engine::new(
            config,
            Arc::new(InMemoryLogSource::new()),
            Arc::new(InMemoryProfileSource::new()),
            Arc::new(tracker),
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
