//! Extraction of free-text clinical notes.
//!
//! Many legacy note tables carry no stable identifier at all. Those rows
//! are never discarded: the record id is derived deterministically from the
//! natural-key tuple (patient code, note date, text) and the row is flagged
//! synthetic so dry-run reports surface it for operator review.

use rusqlite::Row;
use rusqlite::types::Value;
use serde_json::json;

use crate::canonical::{CanonicalRecord, Domain, synthetic_id};
use crate::config::DateWindow;
use crate::error::Result;
use crate::extract::{
    DomainExtractor, DropReason, ExtractionReport, value_to_datetime, value_to_string,
};
use crate::source::{ExtractBounds, LegacySource, TableQuery};

const TABLE_ALIASES: [&str; 3] = ["clinical_notes", "notes", "patient_notes"];
const ID_ALIASES: [&str; 2] = ["note_id", "id"];
const PATIENT_ALIASES: [&str; 3] = ["patient_code", "patient_no", "pat_code"];
const DATE_ALIASES: [&str; 3] = ["note_date", "recorded_at", "date"];
const TEXT_ALIASES: [&str; 4] = ["note", "note_text", "text", "body"];
const CATEGORY_ALIASES: [&str; 2] = ["category", "note_type"];

/// Raw note row before normalization
struct RawNote {
    code: Option<i64>,
    id: Option<Value>,
    recorded: Value,
    text: Value,
    category: Option<Value>,
}

/// Extractor for the `clinical_note` domain
pub struct NoteExtractor {
    source_system: String,
    query: TableQuery,
    has_natural_id: bool,
    recorded_idx: usize,
    text_idx: usize,
    category_idx: Option<usize>,
}

impl NoteExtractor {
    /// Probe the notes table. An id column is optional; when absent the
    /// driver's rowid orders the cursor and record ids become synthetic.
    pub fn probe(src: &LegacySource, source_system: &str) -> Result<Self> {
        let table = src.resolve_table(&TABLE_ALIASES)?;
        let patient_col = src.require_column(&table, &PATIENT_ALIASES)?;
        let date_col = src.require_column(&table, &DATE_ALIASES)?;
        let text_col = src.require_column(&table, &TEXT_ALIASES)?;
        let id_col = src.pick_column(&table, &ID_ALIASES)?;
        let category_col = src.pick_column(&table, &CATEGORY_ALIASES)?;

        let has_natural_id = id_col.is_some();
        let key_col = id_col.unwrap_or_else(|| "rowid".to_string());

        let mut columns = vec![date_col.clone(), text_col];
        let recorded_idx = TableQuery::DOMAIN_OFFSET;
        let text_idx = TableQuery::DOMAIN_OFFSET + 1;
        let category_idx = category_col.map(|col| {
            columns.push(col);
            TableQuery::DOMAIN_OFFSET + columns.len() - 1
        });

        Ok(Self {
            source_system: source_system.to_string(),
            query: TableQuery {
                table,
                patient_col,
                key_col,
                date_col: Some(date_col),
                columns,
            },
            has_natural_id,
            recorded_idx,
            text_idx,
            category_idx,
        })
    }

    fn mapper(&self) -> impl FnMut(&Row<'_>) -> rusqlite::Result<RawNote> + use<> {
        let has_natural_id = self.has_natural_id;
        let recorded_idx = self.recorded_idx;
        let text_idx = self.text_idx;
        let category_idx = self.category_idx;
        move |row| {
            Ok(RawNote {
                code: row.get(0)?,
                id: has_natural_id.then(|| row.get::<_, Value>(1)).transpose()?,
                recorded: row.get(recorded_idx)?,
                text: row.get(text_idx)?,
                category: match category_idx {
                    Some(idx) => Some(row.get(idx)?),
                    None => None,
                },
            })
        }
    }

    fn normalize(
        &self,
        raw: &RawNote,
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

        let text = value_to_string(&raw.text).unwrap_or_default();
        let category = raw.category.as_ref().and_then(value_to_string);

        let (source_record_id, synthetic) =
            match raw.id.as_ref().and_then(value_to_string) {
                Some(id) => (id, false),
                None => (
                    synthetic_id(&[&code.to_string(), &recorded_at.to_string(), &text]),
                    true,
                ),
            };

        report.tally(DropReason::Included);
        Some(CanonicalRecord {
            domain: Domain::ClinicalNote,
            source_system: self.source_system.clone(),
            source_record_id,
            patient_code: Some(code),
            patient_id: None,
            recorded_at,
            entered_at: None,
            tooth: None,
            surface: None,
            code: None,
            status: None,
            payload: json!({ "category": category, "text": text }),
            extracted_at: chrono::Utc::now(),
            synthetic_id: synthetic,
        })
    }
}

impl DomainExtractor for NoteExtractor {
    fn domain(&self) -> Domain {
        Domain::ClinicalNote
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
