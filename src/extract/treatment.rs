//! Extraction of restorative treatment plan items.
//!
//! This is the domain with the strictest business filters: an item must be
//! in the eligible status list, marked completed, reference a positive
//! tooth number, and carry a surface value that fits a 6-bit mask.

use rusqlite::Row;
use rusqlite::types::Value;
use serde_json::json;

use crate::canonical::{CanonicalRecord, Domain, synthetic_id};
use crate::config::DateWindow;
use crate::error::Result;
use crate::extract::{
    DomainExtractor, DropReason, ExtractionReport, value_to_bool, value_to_datetime,
    value_to_i64, value_to_string,
};
use crate::source::{ExtractBounds, LegacySource, TableQuery};

const TABLE_ALIASES: [&str; 3] = ["treatments", "treatment_items", "plan_items"];
const ID_ALIASES: [&str; 3] = ["treatment_id", "item_id", "id"];
const PATIENT_ALIASES: [&str; 3] = ["patient_code", "patient_no", "pat_code"];
const RECORDED_ALIASES: [&str; 3] = ["treatment_date", "completed_at", "date_completed"];
const ENTERED_ALIASES: [&str; 2] = ["entered_at", "created_at"];
const STATUS_ALIASES: [&str; 3] = ["status", "tx_status", "item_status"];
const COMPLETED_ALIASES: [&str; 3] = ["completed", "is_completed", "complete_flag"];
const TOOTH_ALIASES: [&str; 3] = ["tooth", "tooth_number", "tth"];
const SURFACE_ALIASES: [&str; 3] = ["surface", "surfaces", "surface_mask"];
const CODE_ALIASES: [&str; 3] = ["code", "treatment_code", "proc_code"];
const FEE_ALIASES: [&str; 3] = ["fee", "amount", "price"];

/// Statuses eligible for canonical import, compared case-insensitively
pub const ELIGIBLE_STATUSES: [&str; 3] = ["completed", "existing", "accepted"];

/// Largest value a 6-bit surface mask can hold
pub const SURFACE_MASK_MAX: i64 = 0b11_1111;

/// Raw treatment row before normalization
struct RawTreatment {
    code: Option<i64>,
    id: Value,
    recorded: Value,
    entered: Option<Value>,
    status: Value,
    completed: Value,
    tooth: Value,
    surface: Option<Value>,
    treatment_code: Option<Value>,
    fee: Option<Value>,
}

/// Extractor for the `treatment_plan_item` domain
pub struct TreatmentExtractor {
    source_system: String,
    query: TableQuery,
    recorded_idx: usize,
    entered_idx: Option<usize>,
    status_idx: usize,
    completed_idx: usize,
    tooth_idx: usize,
    surface_idx: Option<usize>,
    code_idx: Option<usize>,
    fee_idx: Option<usize>,
}

impl TreatmentExtractor {
    /// Probe the treatments table. Status, completion flag and tooth are
    /// required because the business filters are unusable without them.
    pub fn probe(src: &LegacySource, source_system: &str) -> Result<Self> {
        let table = src.resolve_table(&TABLE_ALIASES)?;
        let id_col = src.require_column(&table, &ID_ALIASES)?;
        let patient_col = src.require_column(&table, &PATIENT_ALIASES)?;
        let recorded_col = src.require_column(&table, &RECORDED_ALIASES)?;
        let status_col = src.require_column(&table, &STATUS_ALIASES)?;
        let completed_col = src.require_column(&table, &COMPLETED_ALIASES)?;
        let tooth_col = src.require_column(&table, &TOOTH_ALIASES)?;

        let mut columns = vec![recorded_col];
        let recorded_idx = TableQuery::DOMAIN_OFFSET;
        let mut push = |col: String| {
            columns.push(col);
            TableQuery::DOMAIN_OFFSET + columns.len() - 1
        };
        let status_idx = push(status_col);
        let completed_idx = push(completed_col);
        let tooth_idx = push(tooth_col);
        let entered_idx = src.pick_column(&table, &ENTERED_ALIASES)?.map(&mut push);
        let surface_idx = src.pick_column(&table, &SURFACE_ALIASES)?.map(&mut push);
        let code_idx = src.pick_column(&table, &CODE_ALIASES)?.map(&mut push);
        let fee_idx = src.pick_column(&table, &FEE_ALIASES)?.map(&mut push);

        Ok(Self {
            source_system: source_system.to_string(),
            query: TableQuery {
                table,
                patient_col,
                key_col: id_col,
                date_col: Some(columns[0].clone()),
                columns,
            },
            recorded_idx,
            entered_idx,
            status_idx,
            completed_idx,
            tooth_idx,
            surface_idx,
            code_idx,
            fee_idx,
        })
    }

    fn mapper(&self) -> impl FnMut(&Row<'_>) -> rusqlite::Result<RawTreatment> + use<> {
        let recorded_idx = self.recorded_idx;
        let entered_idx = self.entered_idx;
        let status_idx = self.status_idx;
        let completed_idx = self.completed_idx;
        let tooth_idx = self.tooth_idx;
        let surface_idx = self.surface_idx;
        let code_idx = self.code_idx;
        let fee_idx = self.fee_idx;
        let opt = |row: &Row<'_>, idx: Option<usize>| -> rusqlite::Result<Option<Value>> {
            idx.map(|i| row.get::<_, Value>(i)).transpose()
        };
        move |row| {
            Ok(RawTreatment {
                code: row.get(0)?,
                id: row.get(1)?,
                recorded: row.get(recorded_idx)?,
                entered: opt(row, entered_idx)?,
                status: row.get(status_idx)?,
                completed: row.get(completed_idx)?,
                tooth: row.get(tooth_idx)?,
                surface: opt(row, surface_idx)?,
                treatment_code: opt(row, code_idx)?,
                fee: opt(row, fee_idx)?,
            })
        }
    }

    fn normalize(
        &self,
        raw: &RawTreatment,
        window: Option<&DateWindow>,
        report: &mut ExtractionReport,
    ) -> Option<CanonicalRecord> {
        let Some(recorded_at) = value_to_datetime(&raw.recorded) else {
            report.tally(DropReason::MissingDate);
            return None;
        };
        if let Some(window) = window {
            if !window.contains(recorded_at) {
                report.tally(DropReason::OutOfWindow);
                return None;
            }
        }
        let Some(code) = raw.code else {
            report.tally(DropReason::MissingPatientCode);
            return None;
        };

        let status = value_to_string(&raw.status).unwrap_or_default();
        if !ELIGIBLE_STATUSES
            .iter()
            .any(|eligible| status.eq_ignore_ascii_case(eligible))
        {
            report.tally(DropReason::StatusNotEligible);
            return None;
        }
        if !value_to_bool(&raw.completed) {
            report.tally(DropReason::NotCompleted);
            return None;
        }
        let tooth = value_to_i64(&raw.tooth);
        let Some(tooth) = tooth.filter(|t| *t > 0) else {
            report.tally(DropReason::MissingTooth);
            return None;
        };
        let surface = raw.surface.as_ref().and_then(value_to_i64);
        if let Some(surface) = surface {
            if !(0..=SURFACE_MASK_MAX).contains(&surface) {
                report.tally(DropReason::InvalidSurface);
                return None;
            }
        }

        let treatment_code = raw.treatment_code.as_ref().and_then(value_to_string);
        let fee = raw.fee.as_ref().and_then(value_to_i64);
        let status = status.to_ascii_lowercase();
        let payload = json!({
            "tooth": tooth,
            "surface": surface,
            "code": treatment_code,
            "status": status,
            "completed": true,
            "fee": fee,
        });

        let (source_record_id, synthetic) = match value_to_string(&raw.id) {
            Some(id) => (id, false),
            None => (
                synthetic_id(&[&code.to_string(), &recorded_at.to_string(), &tooth.to_string()]),
                true,
            ),
        };

        report.tally(DropReason::Included);
        Some(CanonicalRecord {
            domain: Domain::TreatmentPlanItem,
            source_system: self.source_system.clone(),
            source_record_id,
            patient_code: Some(code),
            patient_id: None,
            recorded_at,
            entered_at: raw.entered.as_ref().and_then(value_to_datetime),
            tooth: Some(tooth as i32),
            surface: surface.map(|s| s as i32),
            code: treatment_code,
            status: Some(status),
            payload,
            extracted_at: chrono::Utc::now(),
            synthetic_id: synthetic,
        })
    }
}

impl DomainExtractor for TreatmentExtractor {
    fn domain(&self) -> Domain {
        Domain::TreatmentPlanItem
    }

    fn table(&self) -> &str {
        &self.query.table
    }

    fn extract(
        &self,
        src: &LegacySource,
        bounds: &ExtractBounds,
        batch_size: usize,
        report: &mut ExtractionReport,
    ) -> Result<Vec<CanonicalRecord>> {
        let mut records = Vec::new();
        for raw in self
            .query
            .stream(src, *bounds, batch_size, None, self.mapper())
        {
            let raw = raw?;
            report.scanned += 1;
            if let Some(record) = self.normalize(&raw, bounds.window.as_ref(), report) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn fetch_for_codes(
        &self,
        src: &LegacySource,
        codes: &[i64],
        window: Option<&DateWindow>,
        chunk_size: usize,
    ) -> Result<Vec<CanonicalRecord>> {
        let mut mapper = self.mapper();
        let raws = self
            .query
            .fetch_for_codes(src, codes, window, chunk_size, &mut mapper)?;
        let mut scratch = ExtractionReport::for_table(&self.query.table);
        Ok(raws
            .iter()
            .filter_map(|raw| self.normalize(raw, window, &mut scratch))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(status: &str, completed: i64, tooth: i64, surface: i64) -> RawTreatment {
        RawTreatment {
            code: Some(1_000_035),
            id: Value::Integer(9),
            recorded: Value::Text("2024-01-02T09:30:00".to_string()),
            entered: None,
            status: Value::Text(status.to_string()),
            completed: Value::Integer(completed),
            tooth: Value::Integer(tooth),
            surface: Some(Value::Integer(surface)),
            treatment_code: Some(Value::Text("AMG".to_string())),
            fee: Some(Value::Integer(120)),
        }
    }

    fn extractor() -> TreatmentExtractor {
        TreatmentExtractor {
            source_system: "legacy_pms".to_string(),
            query: TableQuery {
                table: "treatments".to_string(),
                patient_col: "patient_code".to_string(),
                key_col: "treatment_id".to_string(),
                date_col: Some("treatment_date".to_string()),
                columns: vec![],
            },
            recorded_idx: 2,
            entered_idx: None,
            status_idx: 3,
            completed_idx: 4,
            tooth_idx: 5,
            surface_idx: Some(6),
            code_idx: Some(7),
            fee_idx: Some(8),
        }
    }

    #[test]
    fn eligible_completed_row_is_included() {
        let mut report = ExtractionReport::for_table("treatments");
        let record = extractor()
            .normalize(&raw("Completed", 1, 16, 0b10_0100), None, &mut report)
            .unwrap();
        assert_eq!(record.tooth, Some(16));
        assert_eq!(record.surface, Some(0b10_0100));
        assert_eq!(report.included, 1);
    }

    #[test]
    fn ineligible_status_is_counted_not_discarded_silently() {
        let mut report = ExtractionReport::for_table("treatments");
        assert!(
            extractor()
                .normalize(&raw("Planned", 1, 16, 1), None, &mut report)
                .is_none()
        );
        assert_eq!(report.status_not_eligible, 1);
    }

    #[test]
    fn incomplete_row_is_dropped() {
        let mut report = ExtractionReport::for_table("treatments");
        assert!(
            extractor()
                .normalize(&raw("Completed", 0, 16, 1), None, &mut report)
                .is_none()
        );
        assert_eq!(report.not_completed, 1);
    }

    #[test]
    fn tooth_must_be_positive() {
        let mut report = ExtractionReport::for_table("treatments");
        assert!(
            extractor()
                .normalize(&raw("Completed", 1, 0, 1), None, &mut report)
                .is_none()
        );
        assert_eq!(report.missing_tooth, 1);
    }

    #[test]
    fn surface_must_fit_six_bits() {
        let mut report = ExtractionReport::for_table("treatments");
        assert!(
            extractor()
                .normalize(&raw("Completed", 1, 16, 64), None, &mut report)
                .is_none()
        );
        assert_eq!(report.invalid_surface, 1);
        // 63 is the largest valid mask
        assert!(
            extractor()
                .normalize(&raw("Completed", 1, 16, 63), None, &mut report)
                .is_some()
        );
    }
}
