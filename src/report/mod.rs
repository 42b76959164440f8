//! Run summaries: pure aggregation of per-domain outcomes into one
//! machine-readable result with a process exit code.

use serde::Serialize;

use crate::canonical::{Domain, DomainOutcome, UpsertStats};
use crate::error::Result;
use crate::extract::ExtractionReport;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every domain synced
    Success,
    /// Some domains synced, some failed
    Partial,
    /// No domain synced
    Failed,
}

impl RunStatus {
    /// Process exit code for this status
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Partial => 1,
            RunStatus::Failed => 2,
        }
    }
}

/// One domain's contribution to the run summary
#[derive(Debug, Clone, Serialize)]
pub struct DomainSummary {
    /// Domain synced
    pub domain: Domain,
    /// Extraction accounting; absent when the domain failed before reading
    pub report: Option<ExtractionReport>,
    /// Store outcome counts; absent when the domain failed
    pub stats: Option<UpsertStats>,
    /// Failure message, when the domain failed
    pub error: Option<String>,
}

/// Machine-readable summary of one migration run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Overall status
    pub status: RunStatus,
    /// Per-domain detail, in domain order
    pub domains: Vec<DomainSummary>,
    /// Store outcome counts summed over the successful domains
    pub totals: UpsertStats,
}

/// Fold per-domain outcomes into one summary. Pure; no I/O.
#[must_use]
pub fn summarize_run(outcomes: Vec<(Domain, Result<DomainOutcome>)>) -> RunSummary {
    let mut domains = Vec::with_capacity(outcomes.len());
    let mut totals = UpsertStats::default();
    let mut succeeded = 0usize;

    for (domain, outcome) in outcomes {
        match outcome {
            Ok(DomainOutcome { report, stats, .. }) => {
                succeeded += 1;
                totals.created += stats.created;
                totals.updated += stats.updated;
                totals.skipped += stats.skipped;
                domains.push(DomainSummary {
                    domain,
                    report: Some(report),
                    stats: Some(stats),
                    error: None,
                });
            }
            Err(err) => domains.push(DomainSummary {
                domain,
                report: None,
                stats: None,
                error: Some(err.to_string()),
            }),
        }
    }

    let status = match (succeeded, domains.len()) {
        (0, _) => RunStatus::Failed,
        (n, total) if n == total => RunStatus::Success,
        _ => RunStatus::Partial,
    };

    RunSummary {
        status,
        domains,
        totals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    fn ok_outcome(domain: Domain, created: u64) -> (Domain, Result<DomainOutcome>) {
        (
            domain,
            Ok(DomainOutcome {
                domain,
                report: ExtractionReport::for_table("t"),
                stats: UpsertStats {
                    created,
                    updated: 0,
                    skipped: 0,
                },
            }),
        )
    }

    fn failed_outcome(domain: Domain) -> (Domain, Result<DomainOutcome>) {
        (domain, Err(BridgeError::Data("boom".to_string())))
    }

    #[test]
    fn all_success_sums_totals_and_exits_zero() {
        let summary = summarize_run(vec![
            ok_outcome(Domain::BpeEntry, 3),
            ok_outcome(Domain::ClinicalNote, 4),
        ]);
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.totals.created, 7);
        assert_eq!(summary.status.exit_code(), 0);
    }

    #[test]
    fn one_failed_domain_is_partial_not_fatal() {
        let summary = summarize_run(vec![
            ok_outcome(Domain::BpeEntry, 3),
            failed_outcome(Domain::TreatmentPlanItem),
        ]);
        assert_eq!(summary.status, RunStatus::Partial);
        assert_eq!(summary.status.exit_code(), 1);
        assert_eq!(summary.totals.created, 3);
        let failed = &summary.domains[1];
        assert!(failed.error.as_deref().is_some_and(|e| e.contains("boom")));
    }

    #[test]
    fn nothing_succeeding_is_failed() {
        let summary = summarize_run(vec![
            failed_outcome(Domain::BpeEntry),
            failed_outcome(Domain::ClinicalNote),
        ]);
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.status.exit_code(), 2);
    }
}
