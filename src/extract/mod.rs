//! Per-domain extraction: typed rows, business filters, drop accounting.
//!
//! The generic plumbing in [`crate::source`] knows nothing about dentistry;
//! everything domain-specific lives here. Each extractor probes its table
//! once, composes its listing query from the columns that exist, normalizes
//! raw rows into [`CanonicalRecord`]s, and counts every rejected row by
//! reason so nothing is silently discarded.

pub mod bpe;
pub mod notes;
pub mod patients;
pub mod treatment;

use chrono::NaiveDateTime;
use rusqlite::types::Value;
use serde::Serialize;

use crate::canonical::{CanonicalRecord, Domain};
use crate::config::DateWindow;
use crate::error::Result;
use crate::source::{ExtractBounds, LegacySource};

pub use bpe::BpeExtractor;
pub use notes::NoteExtractor;
pub use patients::{LegacyPatient, PatientDirectory};
pub use treatment::TreatmentExtractor;

/// Why a candidate row was excluded from (or included in) canonical import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Row has no parseable business date
    MissingDate,
    /// Business date falls outside the requested window
    OutOfWindow,
    /// Row carries no patient code, so it cannot be attributed
    MissingPatientCode,
    /// Restorative row has no positive tooth number
    MissingTooth,
    /// Surface value does not fit a 6-bit mask
    InvalidSurface,
    /// Status is not in the domain's allow-list
    StatusNotEligible,
    /// Row is not marked completed
    NotCompleted,
    /// A row with the same unique key already appeared in this batch
    DuplicateKey,
    /// Row passed every filter
    Included,
}

/// Ephemeral per-pass counters, one per drop reason.
///
/// Closure invariant: `included + sum(drop reasons) == scanned` for every
/// extraction pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionReport {
    /// Source table this pass read
    pub table: String,
    /// Candidate rows scanned
    pub scanned: u64,
    /// Rows that passed every filter
    pub included: u64,
    /// Rows with no parseable business date
    pub missing_date: u64,
    /// Rows outside the requested window
    pub out_of_window: u64,
    /// Rows with no patient code
    pub missing_patient_code: u64,
    /// Restorative rows without a positive tooth number
    pub missing_tooth: u64,
    /// Rows whose surface value exceeds the 6-bit mask
    pub invalid_surface: u64,
    /// Rows with an ineligible status
    pub status_not_eligible: u64,
    /// Rows not marked completed
    pub not_completed: u64,
    /// Rows deduplicated within the batch
    pub duplicate_key: u64,
}

impl ExtractionReport {
    /// New report for one source table
    #[must_use]
    pub fn for_table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    /// Count one row under `reason`
    pub fn tally(&mut self, reason: DropReason) {
        match reason {
            DropReason::MissingDate => self.missing_date += 1,
            DropReason::OutOfWindow => self.out_of_window += 1,
            DropReason::MissingPatientCode => self.missing_patient_code += 1,
            DropReason::MissingTooth => self.missing_tooth += 1,
            DropReason::InvalidSurface => self.invalid_surface += 1,
            DropReason::StatusNotEligible => self.status_not_eligible += 1,
            DropReason::NotCompleted => self.not_completed += 1,
            DropReason::DuplicateKey => self.duplicate_key += 1,
            DropReason::Included => self.included += 1,
        }
    }

    /// Total rows dropped, across every reason
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.missing_date
            + self.out_of_window
            + self.missing_patient_code
            + self.missing_tooth
            + self.invalid_surface
            + self.status_not_eligible
            + self.not_completed
            + self.duplicate_key
    }

    /// Whether the closure invariant holds for this pass
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.included + self.dropped() == self.scanned
    }
}

/// A probed, ready-to-run extractor for one domain.
///
/// Probing happens at construction, so schema drift surfaces as a per-domain
/// error before any row is read and sibling domains are unaffected.
pub trait DomainExtractor {
    /// Domain this extractor produces
    fn domain(&self) -> Domain;

    /// Actual source table name in this deployment
    fn table(&self) -> &str;

    /// Run a full extraction pass under `bounds`, counting every candidate
    /// row into `report`.
    fn extract(
        &self,
        src: &LegacySource,
        bounds: &ExtractBounds,
        batch_size: usize,
        report: &mut ExtractionReport,
    ) -> Result<Vec<CanonicalRecord>>;

    /// Fetch normalized rows for an explicit patient-code list, chunked.
    /// Applies the same business filters as [`Self::extract`].
    fn fetch_for_codes(
        &self,
        src: &LegacySource,
        codes: &[i64],
        window: Option<&DateWindow>,
        chunk_size: usize,
    ) -> Result<Vec<CanonicalRecord>>;
}

/// Probe the extractor for `domain` against the live source schema
pub fn probe_domain(
    src: &LegacySource,
    domain: Domain,
    source_system: &str,
) -> Result<Box<dyn DomainExtractor>> {
    match domain {
        Domain::BpeEntry => Ok(Box::new(BpeExtractor::probe(src, source_system)?)),
        Domain::TreatmentPlanItem => Ok(Box::new(TreatmentExtractor::probe(src, source_system)?)),
        Domain::ClinicalNote => Ok(Box::new(NoteExtractor::probe(src, source_system)?)),
    }
}

/// Datetime formats legacy deployments have been seen to use, tried in order
const SOURCE_DATETIME_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d",
];

/// Parse a raw source timestamp, trying each known format.
/// Date-only values land at midnight.
#[must_use]
pub fn parse_source_datetime(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    for format in SOURCE_DATETIME_FORMATS {
        if let Ok(at) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(at);
        }
        if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Coerce a raw column value to text; legacy ids show up as either
pub(crate) fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(f.to_string()),
        Value::Null | Value::Blob(_) => None,
    }
}

/// Coerce a raw column value to an integer
pub(crate) fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Text(s) => s.trim().parse().ok(),
        Value::Real(f) => Some(*f as i64),
        Value::Null | Value::Blob(_) => None,
    }
}

/// Coerce a raw flag column to a boolean
pub(crate) fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Integer(i) => *i != 0,
        Value::Text(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "y" | "yes" | "true" | "t"
        ),
        _ => false,
    }
}

/// Coerce a raw column value to a timestamp
pub(crate) fn value_to_datetime(value: &Value) -> Option<NaiveDateTime> {
    value_to_string(value).and_then(|s| parse_source_datetime(&s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_closure_holds_across_reasons() {
        let mut report = ExtractionReport::for_table("treatments");
        report.scanned = 5;
        report.tally(DropReason::Included);
        report.tally(DropReason::Included);
        report.tally(DropReason::MissingTooth);
        report.tally(DropReason::InvalidSurface);
        report.tally(DropReason::StatusNotEligible);
        assert!(report.is_closed());
        report.scanned += 1;
        assert!(!report.is_closed());
    }

    #[test]
    fn datetime_parsing_covers_known_legacy_formats() {
        for raw in [
            "2024-01-02T09:30:00",
            "2024-01-02 09:30:00",
            "2024-01-02T09:30:00.125",
            "2024-01-02",
        ] {
            assert!(parse_source_datetime(raw).is_some(), "failed on {raw}");
        }
        assert!(parse_source_datetime("02/01/24 9am").is_none());
    }

    #[test]
    fn date_only_values_land_at_midnight() {
        let at = parse_source_datetime("2024-01-02").unwrap();
        assert_eq!(at.format("%H:%M:%S").to_string(), "00:00:00");
    }

    #[test]
    fn value_coercion_accepts_mixed_storage_classes() {
        assert_eq!(value_to_string(&Value::Integer(42)), Some("42".to_string()));
        assert_eq!(value_to_i64(&Value::Text(" 7 ".to_string())), Some(7));
        assert!(value_to_bool(&Value::Text("Y".to_string())));
        assert!(!value_to_bool(&Value::Null));
        assert_eq!(value_to_string(&Value::Text("  ".to_string())), None);
    }
}
