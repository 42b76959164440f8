//! Extraction of periodontal screening (BPE) entries.

use rusqlite::Row;
use rusqlite::types::Value;
use serde_json::json;

use crate::canonical::{CanonicalRecord, Domain, synthetic_id};
use crate::config::DateWindow;
use crate::error::Result;
use crate::extract::{
    DomainExtractor, DropReason, ExtractionReport, value_to_datetime, value_to_i64,
    value_to_string,
};
use crate::source::{ExtractBounds, LegacySource, TableQuery};

const TABLE_ALIASES: [&str; 3] = ["bpe_entries", "bpe", "perio_bpe"];
const ID_ALIASES: [&str; 3] = ["bpe_id", "entry_id", "id"];
const PATIENT_ALIASES: [&str; 3] = ["patient_code", "patient_no", "pat_code"];
const RECORDED_ALIASES: [&str; 3] = ["recorded_at", "bpe_date", "date_recorded"];
const ENTERED_ALIASES: [&str; 3] = ["entered_at", "date_entered", "created_at"];

/// Raw BPE row before normalization
struct RawBpe {
    code: Option<i64>,
    id: Value,
    recorded: Value,
    entered: Option<Value>,
    sextants: [Option<Value>; 6],
}

/// Extractor for the `bpe_entry` domain
pub struct BpeExtractor {
    source_system: String,
    query: TableQuery,
    recorded_idx: usize,
    entered_idx: Option<usize>,
    sextant_idx: [Option<usize>; 6],
}

impl BpeExtractor {
    /// Probe the BPE table and build the listing query from the columns
    /// this deployment actually has. Sextant columns are optional; the id,
    /// patient and recorded-at columns are required.
    pub fn probe(src: &LegacySource, source_system: &str) -> Result<Self> {
        let table = src.resolve_table(&TABLE_ALIASES)?;
        let id_col = src.require_column(&table, &ID_ALIASES)?;
        let patient_col = src.require_column(&table, &PATIENT_ALIASES)?;
        let recorded_col = src.require_column(&table, &RECORDED_ALIASES)?;
        let entered_col = src.pick_column(&table, &ENTERED_ALIASES)?;

        let mut columns = vec![recorded_col];
        let recorded_idx = TableQuery::DOMAIN_OFFSET;
        let entered_idx = entered_col.map(|col| {
            columns.push(col);
            TableQuery::DOMAIN_OFFSET + columns.len() - 1
        });

        let mut sextant_idx = [None; 6];
        for (i, slot) in sextant_idx.iter_mut().enumerate() {
            let n = i + 1;
            let aliases = [format!("sextant_{n}"), format!("sext{n}"), format!("s{n}")];
            let alias_refs: Vec<&str> = aliases.iter().map(String::as_str).collect();
            if let Some(col) = src.pick_column(&table, &alias_refs)? {
                columns.push(col);
                *slot = Some(TableQuery::DOMAIN_OFFSET + columns.len() - 1);
            }
        }

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
            sextant_idx,
        })
    }

    fn mapper(&self) -> impl FnMut(&Row<'_>) -> rusqlite::Result<RawBpe> + use<> {
        let recorded_idx = self.recorded_idx;
        let entered_idx = self.entered_idx;
        let sextant_idx = self.sextant_idx;
        move |row| {
            let mut sextants: [Option<Value>; 6] = Default::default();
            for (slot, idx) in sextants.iter_mut().zip(sextant_idx) {
                if let Some(idx) = idx {
                    *slot = Some(row.get::<_, Value>(idx)?);
                }
            }
            Ok(RawBpe {
                code: row.get(0)?,
                id: row.get(1)?,
                recorded: row.get(recorded_idx)?,
                entered: match entered_idx {
                    Some(idx) => Some(row.get(idx)?),
                    None => None,
                },
                sextants,
            })
        }
    }

    fn normalize(
        &self,
        raw: &RawBpe,
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

        let mut payload = serde_json::Map::new();
        for (i, value) in raw.sextants.iter().enumerate() {
            let score = value.as_ref().and_then(value_to_i64);
            payload.insert(format!("sextant_{}", i + 1), json!(score));
        }

        let (source_record_id, synthetic) = match value_to_string(&raw.id) {
            Some(id) => (id, false),
            None => (
                synthetic_id(&[&code.to_string(), &recorded_at.to_string()]),
                true,
            ),
        };

        report.tally(DropReason::Included);
        Some(CanonicalRecord {
            domain: Domain::BpeEntry,
            source_system: self.source_system.clone(),
            source_record_id,
            patient_code: Some(code),
            patient_id: None,
            recorded_at,
            entered_at: raw.entered.as_ref().and_then(value_to_datetime),
            tooth: None,
            surface: None,
            code: None,
            status: None,
            payload: serde_json::Value::Object(payload),
            extracted_at: chrono::Utc::now(),
            synthetic_id: synthetic,
        })
    }
}

impl DomainExtractor for BpeExtractor {
    fn domain(&self) -> Domain {
        Domain::BpeEntry
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
