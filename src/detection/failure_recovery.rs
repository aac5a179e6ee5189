use chrono::Duration;

use super::{DetectionContext, Detector};
use crate::models::{Finding, FindingKind, Outcome};

/// Flags failed attempts the user never followed up with a success
///
/// A failure at `t` is recovered by any success in `(t, t + window]`. Each
/// failure is judged on its own, so a burst of failures yields one finding
/// per failure that lacks a recovery.
pub struct FailureRecoveryDetector {
    recovery_window: Duration,
}

impl FailureRecoveryDetector {
    pub fn new(recovery_window: Duration) -> Self {
        FailureRecoveryDetector { recovery_window }
    }

    fn is_recovered(&self, ctx: &DetectionContext<'_>, index: usize) -> bool {
        let failure = &ctx.events[index];
        let deadline = failure.timestamp + self.recovery_window;
        ctx.events[index + 1..]
            .iter()
            .take_while(|e| e.timestamp <= deadline)
            .any(|e| e.outcome == Outcome::Success && e.timestamp > failure.timestamp)
    }
}

impl Default for FailureRecoveryDetector {
    fn default() -> Self {
        Self::new(Duration::minutes(30))
    }
}

impl Detector for FailureRecoveryDetector {
    fn kind(&self) -> FindingKind {
        FindingKind::FailureWithoutRecovery
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Vec<Finding> {
        ctx.in_window()
            .filter(|(_, e)| e.outcome == Outcome::Failure)
            .filter(|(i, _)| !self.is_recovered(ctx, *i))
            .map(|(i, failure)| {
                let mut evidence = vec![failure.clone()];
                if let Some(next) = ctx.events.get(i + 1) {
                    evidence.push(next.clone());
                }
                ctx.finding(
                    FindingKind::FailureWithoutRecovery,
                    evidence,
                    None,
                    format!(
                        "User '{}' failed {} at {} with no success in the following {} minutes.",
                        ctx.user,
                        failure.target,
                        failure.timestamp.to_rfc3339(),
                        self.recovery_window.num_minutes()
                    ),
                )
            })
            .collect()
    }
}
