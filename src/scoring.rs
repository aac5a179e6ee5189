//! Scoring and ranking
//!
//! A user's score is the sum of their finding weights. Ordering is a
//! priority-class override on top of the score: anyone with a fraud report
//! ranks above everyone without one, whatever the numbers say.

use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};

use crate::models::{AuthEvent, Finding, FindingKind, UserVerdict};

/// Sum of finding weights
pub fn score(findings: &[Finding]) -> u32 {
    findings
        .iter()
        .fold(0u32, |total, f| total.saturating_add(f.weight))
}

/// Order findings for display: earliest evidence first, then detector kind
pub fn order_findings(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        let by_time = match (a.first_evidence(), b.first_evidence()) {
            (Some(x), Some(y)) => AuthEvent::chronological(x, y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_time.then_with(|| a.kind.cmp(&b.kind))
    });
}

/// Build an unranked verdict; users without findings have none
pub fn verdict(user: impl Into<String>, mut findings: Vec<Finding>) -> Option<UserVerdict> {
    if findings.is_empty() {
        return None;
    }
    order_findings(&mut findings);
    Some(UserVerdict {
        user: user.into(),
        score: score(&findings),
        findings,
        rank: 0,
    })
}

/// Priority class first, then score, then earliest evidence, then user id
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct RankKey<'a> {
    fraud: Reverse<bool>,
    score: Reverse<u32>,
    earliest: Option<DateTime<Utc>>,
    user: &'a str,
}

impl<'a> RankKey<'a> {
    fn of(verdict: &'a UserVerdict) -> Self {
        RankKey {
            fraud: Reverse(verdict.has_fraud()),
            score: Reverse(verdict.score),
            earliest: verdict.earliest_timestamp(),
            user: &verdict.user,
        }
    }
}

/// Sort verdicts into review order (total and reproducible)
pub fn sort_verdicts(verdicts: &mut [UserVerdict]) {
    verdicts.sort_by(|a, b| RankKey::of(a).cmp(&RankKey::of(b)));
}

/// Assign 1-based ranks in the current order
pub fn assign_ranks(verdicts: &mut [UserVerdict]) {
    for (i, verdict) in verdicts.iter_mut().enumerate() {
        verdict.rank = i + 1;
    }
}

/// Score, drop users without findings, sort and rank
pub fn rank<I, S>(users: I) -> Vec<UserVerdict>
where
    I: IntoIterator<Item = (S, Vec<Finding>)>,
    S: Into<String>,
{
    let mut verdicts: Vec<UserVerdict> = users
        .into_iter()
        .filter_map(|(user, findings)| verdict(user, findings))
        .collect();
    sort_verdicts(&mut verdicts);
    assign_ranks(&mut verdicts);
    verdicts
}

/// Per-kind finding counts, for run logging
pub fn kind_counts(verdicts: &[UserVerdict]) -> Vec<(FindingKind, usize)> {
    FindingKind::ALL
        .iter()
        .map(|kind| (*kind, verdicts.iter().map(|v| v.count(*kind)).sum()))
        .collect()
}
