use super::{DetectionContext, Detector};
use crate::models::{Finding, FindingKind, Outcome};

/// Flags every push the user reported as fraudulent
pub struct FraudReportDetector;

impl Detector for FraudReportDetector {
    fn kind(&self) -> FindingKind {
        FindingKind::FraudReport
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Vec<Finding> {
        ctx.in_window()
            .filter(|(_, e)| e.outcome == Outcome::FraudReport)
            .map(|(_, e)| {
                ctx.finding(
                    FindingKind::FraudReport,
                    vec![e.clone()],
                    None,
                    format!(
                        "User '{}' reported a {} prompt as fraudulent at {}.",
                        ctx.user,
                        e.target,
                        e.timestamp.to_rfc3339()
                    ),
                )
            })
            .collect()
    }
}
