use super::{DetectionContext, Detector};
use crate::models::{Finding, FindingKind, Outcome, TargetSystem};

/// Flags failed logins to the device management portal, where a user (or an
/// attacker) would enroll a new second factor
pub struct DmpFailureDetector;

impl Detector for DmpFailureDetector {
    fn kind(&self) -> FindingKind {
        FindingKind::DmpFailure
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Vec<Finding> {
        ctx.in_window()
            .filter(|(_, e)| {
                e.target == TargetSystem::DeviceManagementPortal && e.outcome == Outcome::Failure
            })
            .map(|(_, e)| {
                let origin = e
                    .source_ip
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "an unknown address".to_string());
                ctx.finding(
                    FindingKind::DmpFailure,
                    vec![e.clone()],
                    None,
                    format!(
                        "User '{}' failed to access the device management portal from {} at {}.",
                        ctx.user,
                        origin,
                        e.timestamp.to_rfc3339()
                    ),
                )
            })
            .collect()
    }
}
