//! Persistent canonical store: records, mappings, markers, patients.
//!
//! The record table is keyed by `unique_key` with a storage-level primary
//! key, so even a lost read-then-write race degenerates to a conflict-aware
//! overwrite rather than a duplicate row. Accurate created/updated counts
//! still require overlapping runs to be serialized externally; see the
//! module docs on [`crate::canonical::sync`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use itertools::Itertools;
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, params};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::canonical::{CanonicalRecord, Domain};
use crate::config::DateWindow;
use crate::error::{BridgeError, Result};
use crate::identity::{InternalCandidate, ManualMapping, PatientMapping};

/// Keys fetched per round-trip when pre-loading existing rows
const KEY_FETCH_CHUNK: usize = 100;

/// Counts of the three upsert outcomes. Always reported distinctly so
/// unexpected drift between runs is visible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    /// Records with no prior row
    pub created: u64,
    /// Records whose comparable fields changed
    pub updated: u64,
    /// Records identical to their stored row
    pub skipped: u64,
}

impl UpsertStats {
    /// Total records processed
    #[must_use]
    pub fn total(&self) -> u64 {
        self.created + self.updated + self.skipped
    }
}

/// Per-patient "last successfully imported at" marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportMarker {
    /// Internal patient id
    pub patient_id: i64,
    /// Last time any canonical record for this patient was created or updated
    pub imported_at: DateTime<Utc>,
}

/// Filter for the canonical read API
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Restrict to one domain
    pub domain: Option<Domain>,
    /// Restrict to one resolved patient
    pub patient_id: Option<i64>,
    /// Restrict to one legacy patient code
    pub patient_code: Option<i64>,
    /// Restrict to a half-open business-date window
    pub window: Option<DateWindow>,
    /// Keep only the newest N rows
    pub limit: Option<usize>,
}

/// SQLite-backed canonical store
pub struct CanonicalStore {
    conn: Connection,
}

/// Row shape read back from the record table, before domain-tag parsing
struct StoredRecordRow {
    domain: String,
    source_system: String,
    source_record_id: String,
    patient_code: Option<i64>,
    patient_id: Option<i64>,
    recorded_at: NaiveDateTime,
    entered_at: Option<NaiveDateTime>,
    tooth: Option<i32>,
    surface: Option<i32>,
    code: Option<String>,
    status: Option<String>,
    payload: serde_json::Value,
    extracted_at: DateTime<Utc>,
}

const RECORD_COLUMNS: &str = "domain, source_system, source_record_id, patient_code, \
     patient_id, recorded_at, entered_at, tooth, surface, code, status, payload, extracted_at";

impl CanonicalStore {
    /// Open (creating if needed) the canonical store at `path`
    pub fn open(path: &str) -> Result<Self> {
        let store = Self {
            conn: Connection::open(path)?,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS canonical_records (
                unique_key       TEXT PRIMARY KEY,
                domain           TEXT NOT NULL,
                source_system    TEXT NOT NULL,
                source_record_id TEXT NOT NULL,
                patient_code     INTEGER,
                patient_id       INTEGER,
                recorded_at      TEXT NOT NULL,
                entered_at       TEXT,
                tooth            INTEGER,
                surface          INTEGER,
                code             TEXT,
                status           TEXT,
                payload          TEXT NOT NULL,
                extracted_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_read
                ON canonical_records (domain, patient_id, recorded_at);
            CREATE INDEX IF NOT EXISTS idx_records_code
                ON canonical_records (domain, patient_code, recorded_at);
            CREATE TABLE IF NOT EXISTS patient_mappings (
                source     TEXT NOT NULL,
                code       INTEGER NOT NULL,
                patient_id INTEGER NOT NULL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (source, code)
            );
            CREATE TABLE IF NOT EXISTS manual_mappings (
                source     TEXT NOT NULL,
                code       INTEGER NOT NULL,
                patient_id INTEGER NOT NULL,
                note       TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (source, code)
            );
            CREATE TABLE IF NOT EXISTS import_markers (
                patient_id  INTEGER PRIMARY KEY,
                imported_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS patients (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                surname          TEXT NOT NULL,
                first_name       TEXT,
                dob              TEXT,
                postcode         TEXT,
                phone            TEXT,
                legacy_reference TEXT
            );",
        )?;
        Ok(())
    }

    // --- canonical records -------------------------------------------------

    /// Read the `RECORD_COLUMNS` block starting at column `at`
    fn record_from_row(row: &rusqlite::Row<'_>, at: usize) -> rusqlite::Result<StoredRecordRow> {
        Ok(StoredRecordRow {
            domain: row.get(at)?,
            source_system: row.get(at + 1)?,
            source_record_id: row.get(at + 2)?,
            patient_code: row.get(at + 3)?,
            patient_id: row.get(at + 4)?,
            recorded_at: row.get(at + 5)?,
            entered_at: row.get(at + 6)?,
            tooth: row.get(at + 7)?,
            surface: row.get(at + 8)?,
            code: row.get(at + 9)?,
            status: row.get(at + 10)?,
            payload: row.get(at + 11)?,
            extracted_at: row.get(at + 12)?,
        })
    }

    fn into_record(row: StoredRecordRow) -> Result<CanonicalRecord> {
        Ok(CanonicalRecord {
            domain: Domain::parse(&row.domain)?,
            source_system: row.source_system,
            source_record_id: row.source_record_id,
            patient_code: row.patient_code,
            patient_id: row.patient_id,
            recorded_at: row.recorded_at,
            entered_at: row.entered_at,
            tooth: row.tooth,
            surface: row.surface,
            code: row.code,
            status: row.status,
            payload: row.payload,
            extracted_at: row.extracted_at,
            synthetic_id: false,
        })
    }

    /// Bulk-fetch stored records by unique key, chunked
    pub fn fetch_by_keys(&self, keys: &[String]) -> Result<FxHashMap<String, CanonicalRecord>> {
        let mut found = FxHashMap::default();
        for chunk in keys.chunks(KEY_FETCH_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT unique_key, {RECORD_COLUMNS} FROM canonical_records \
                 WHERE unique_key IN ({placeholders})"
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                let key: String = row.get(0)?;
                let stored = Self::record_from_row(row, 1)?;
                found.insert(key, Self::into_record(stored)?);
            }
        }
        Ok(found)
    }

    /// Idempotently persist a batch of canonical records.
    ///
    /// Records are committed in bounded sub-batches with a flush point
    /// between them: an interruption leaves every prior sub-batch durable,
    /// and re-running on unchanged data is a no-op. Callers must have
    /// deduplicated the batch by unique key.
    pub fn upsert_batch(
        &self,
        records: &[CanonicalRecord],
        flush_size: usize,
    ) -> Result<UpsertStats> {
        let mut stats = UpsertStats::default();
        for sub_batch in records.chunks(flush_size.max(1)) {
            let tx = self.conn.unchecked_transaction()?;

            let mut keys = Vec::with_capacity(sub_batch.len() * 2);
            for record in sub_batch {
                keys.push(record.unique_key());
                // History stored before this patient's mapping existed
                // lives under the legacy-code key; fetch that too so it
                // re-attaches instead of duplicating.
                if let Some(key) = record.unresolved_key() {
                    keys.push(key);
                }
            }
            let existing = self.fetch_by_keys(&keys)?;

            for record in sub_batch {
                let key = record.unique_key();
                let stored = existing
                    .get(&key)
                    .map(|stored| (key.clone(), stored))
                    .or_else(|| {
                        record
                            .unresolved_key()
                            .and_then(|k| existing.get(&k).map(|stored| (k, stored)))
                    });

                match stored {
                    None => {
                        self.insert_record(&key, record)?;
                        stats.created += 1;
                        self.touch_marker_for(record)?;
                    }
                    Some((stored_key, stored)) if stored.comparable_eq(record) => {
                        debug!("skipped {stored_key}: no comparable change");
                        stats.skipped += 1;
                    }
                    Some((stored_key, stored)) => {
                        let changes = stored.diff(record);
                        info!(
                            "updated {stored_key}: {}",
                            changes
                                .iter()
                                .map(|c| format!("{} {} -> {}", c.field, c.before, c.after))
                                .join(", ")
                        );
                        self.update_record(&stored_key, &key, record)?;
                        stats.updated += 1;
                        self.touch_marker_for(record)?;
                    }
                }
            }
            tx.commit()?;
        }
        Ok(stats)
    }

    fn insert_record(&self, key: &str, record: &CanonicalRecord) -> Result<()> {
        // Conflict-aware: if a concurrent run slipped the same key in
        // between our read and this write, overwrite instead of failing.
        self.conn.execute(
            &format!(
                "INSERT INTO canonical_records (unique_key, {RECORD_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
                 ON CONFLICT(unique_key) DO UPDATE SET \
                 patient_code = excluded.patient_code, patient_id = excluded.patient_id, \
                 recorded_at = excluded.recorded_at, entered_at = excluded.entered_at, \
                 tooth = excluded.tooth, surface = excluded.surface, code = excluded.code, \
                 status = excluded.status, payload = excluded.payload, \
                 extracted_at = excluded.extracted_at"
            ),
            params![
                key,
                record.domain.as_str(),
                record.source_system,
                record.source_record_id,
                record.patient_code,
                record.patient_id,
                record.recorded_at,
                record.entered_at,
                record.tooth,
                record.surface,
                record.code,
                record.status,
                record.payload,
                record.extracted_at,
            ],
        )?;
        Ok(())
    }

    fn update_record(&self, stored_key: &str, new_key: &str, record: &CanonicalRecord) -> Result<()> {
        self.conn.execute(
            "UPDATE canonical_records SET unique_key = ?1, patient_code = ?2, patient_id = ?3, \
             recorded_at = ?4, entered_at = ?5, tooth = ?6, surface = ?7, code = ?8, \
             status = ?9, payload = ?10, extracted_at = ?11 WHERE unique_key = ?12",
            params![
                new_key,
                record.patient_code,
                record.patient_id,
                record.recorded_at,
                record.entered_at,
                record.tooth,
                record.surface,
                record.code,
                record.status,
                record.payload,
                record.extracted_at,
                stored_key,
            ],
        )?;
        Ok(())
    }

    fn touch_marker_for(&self, record: &CanonicalRecord) -> Result<()> {
        if let Some(patient_id) = record.patient_id {
            self.conn.execute(
                "INSERT INTO import_markers (patient_id, imported_at) VALUES (?1, ?2) \
                 ON CONFLICT(patient_id) DO UPDATE SET imported_at = excluded.imported_at",
                params![patient_id, record.extracted_at],
            )?;
        }
        Ok(())
    }

    /// Last-imported marker for a patient, if any record has landed
    pub fn import_marker(&self, patient_id: i64) -> Result<Option<ImportMarker>> {
        Ok(self
            .conn
            .query_row(
                "SELECT patient_id, imported_at FROM import_markers WHERE patient_id = ?1",
                [patient_id],
                |row| {
                    Ok(ImportMarker {
                        patient_id: row.get(0)?,
                        imported_at: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    /// Canonical read API: list records newest first under `filter`
    pub fn list_records(&self, filter: &RecordFilter) -> Result<Vec<CanonicalRecord>> {
        let mut sql = format!(
            "SELECT unique_key, {RECORD_COLUMNS} FROM canonical_records WHERE 1 = 1"
        );
        let mut params: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(domain) = filter.domain {
            sql.push_str(" AND domain = ?");
            params.push(domain.as_str().to_string().into());
        }
        if let Some(patient_id) = filter.patient_id {
            sql.push_str(" AND patient_id = ?");
            params.push(patient_id.into());
        }
        if let Some(code) = filter.patient_code {
            sql.push_str(" AND patient_code = ?");
            params.push(code.into());
        }
        if let Some(window) = &filter.window {
            sql.push_str(" AND recorded_at >= ? AND recorded_at < ?");
            params.push(crate::source::query::datetime_param(window.from));
            params.push(crate::source::query::datetime_param(window.to));
        }
        sql.push_str(" ORDER BY recorded_at DESC, source_record_id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            params.push((limit as i64).into());
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(Self::into_record(Self::record_from_row(row, 1)?)?);
        }
        Ok(records)
    }

    // --- patient mappings --------------------------------------------------

    /// Automatic mapping lookup by (source, code)
    pub fn automatic_mapping(&self, source: &str, code: i64) -> Result<Option<PatientMapping>> {
        Ok(self
            .conn
            .query_row(
                "SELECT source, code, patient_id, created_by FROM patient_mappings \
                 WHERE source = ?1 AND code = ?2",
                params![source, code],
                |row| {
                    Ok(PatientMapping {
                        source: row.get(0)?,
                        code: row.get(1)?,
                        patient_id: row.get(2)?,
                        created_by: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    /// Persist an automatic mapping. A legacy code maps to at most one
    /// internal patient; an existing mapping to a different patient is an
    /// error, never silently replaced.
    pub fn insert_automatic_mapping(
        &self,
        source: &str,
        code: i64,
        patient_id: i64,
        created_by: &str,
    ) -> Result<()> {
        if let Some(existing) = self.automatic_mapping(source, code)? {
            if existing.patient_id == patient_id {
                return Ok(());
            }
            return Err(BridgeError::Data(format!(
                "mapping ({source}, {code}) already points at patient {}; \
                 remapping is an administrative action",
                existing.patient_id
            )));
        }
        self.conn.execute(
            "INSERT INTO patient_mappings (source, code, patient_id, created_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![source, code, patient_id, created_by, Utc::now()],
        )?;
        Ok(())
    }

    /// Administrative remap of an automatic mapping
    pub fn remap_patient(
        &self,
        source: &str,
        code: i64,
        patient_id: i64,
        actor: &str,
    ) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE patient_mappings SET patient_id = ?3, created_by = ?4, created_at = ?5 \
             WHERE source = ?1 AND code = ?2",
            params![source, code, patient_id, actor, Utc::now()],
        )?;
        if changed == 0 {
            self.insert_automatic_mapping(source, code, patient_id, actor)?;
        }
        Ok(())
    }

    // --- manual mappings ---------------------------------------------------

    /// Manual override lookup by (source, code)
    pub fn manual_mapping(&self, source: &str, code: i64) -> Result<Option<ManualMapping>> {
        Ok(self
            .conn
            .query_row(
                "SELECT source, code, patient_id, note FROM manual_mappings \
                 WHERE source = ?1 AND code = ?2",
                params![source, code],
                |row| {
                    Ok(ManualMapping {
                        source: row.get(0)?,
                        code: row.get(1)?,
                        patient_id: row.get(2)?,
                        note: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    /// Create a manual override. Refused when an automatic mapping already
    /// binds the code to a different patient.
    pub fn create_manual_mapping(&self, mapping: &ManualMapping) -> Result<()> {
        if let Some(auto) = self.automatic_mapping(&mapping.source, mapping.code)? {
            if auto.patient_id != mapping.patient_id {
                return Err(BridgeError::Data(format!(
                    "automatic mapping ({}, {}) already points at patient {}; \
                     remove or remap it first",
                    mapping.source, mapping.code, auto.patient_id
                )));
            }
        }
        self.conn.execute(
            "INSERT INTO manual_mappings (source, code, patient_id, note, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(source, code) DO UPDATE SET \
             patient_id = excluded.patient_id, note = excluded.note",
            params![
                mapping.source,
                mapping.code,
                mapping.patient_id,
                mapping.note,
                Utc::now()
            ],
        )?;
        Ok(())
    }

    /// List manual overrides for one source, code ascending
    pub fn list_manual_mappings(&self, source: &str) -> Result<Vec<ManualMapping>> {
        let mut stmt = self.conn.prepare(
            "SELECT source, code, patient_id, note FROM manual_mappings \
             WHERE source = ?1 ORDER BY code ASC",
        )?;
        let mappings = stmt
            .query_map([source], |row| {
                Ok(ManualMapping {
                    source: row.get(0)?,
                    code: row.get(1)?,
                    patient_id: row.get(2)?,
                    note: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mappings)
    }

    /// Delete a manual override; returns whether one existed
    pub fn delete_manual_mapping(&self, source: &str, code: i64) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM manual_mappings WHERE source = ?1 AND code = ?2",
            params![source, code],
        )?;
        Ok(deleted > 0)
    }

    // --- internal patients -------------------------------------------------

    /// Create an internal patient record, returning its id
    pub fn create_patient(
        &self,
        surname: &str,
        first_name: Option<&str>,
        dob: Option<NaiveDate>,
        postcode: Option<&str>,
        phone: Option<&str>,
        legacy_reference: Option<&str>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO patients (surname, first_name, dob, postcode, phone, legacy_reference) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![surname, first_name, dob, postcode, phone, legacy_reference],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Find an internal patient by exact (surname, first name, DOB), or
    /// create one. Anything fuzzier goes through the offline scorer and a
    /// human, never this path.
    pub fn find_or_create_patient(
        &self,
        surname: &str,
        first_name: Option<&str>,
        dob: Option<NaiveDate>,
        legacy_reference: Option<&str>,
    ) -> Result<i64> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM patients \
                 WHERE lower(surname) = lower(?1) \
                 AND ((?2 IS NULL AND first_name IS NULL) OR lower(first_name) = lower(?2)) \
                 AND ((?3 IS NULL AND dob IS NULL) OR dob = ?3) \
                 ORDER BY id ASC LIMIT 1",
                params![surname, first_name, dob],
                |row| row.get(0),
            )
            .optional()?;
        match found {
            Some(id) => Ok(id),
            None => self.create_patient(surname, first_name, dob, None, None, legacy_reference),
        }
    }

    /// Candidates for the offline scorer: internal patients sharing a
    /// surname, id ascending.
    pub fn candidates_by_surname(&self, surname: &str) -> Result<Vec<InternalCandidate>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, surname, first_name, dob, postcode, phone, legacy_reference \
             FROM patients WHERE lower(surname) = lower(?1) ORDER BY id ASC",
        )?;
        let candidates = stmt
            .query_map([surname], |row| {
                Ok(InternalCandidate {
                    id: row.get(0)?,
                    surname: row.get(1)?,
                    first_name: row.get(2)?,
                    dob: row.get(3)?,
                    postcode: row.get(4)?,
                    phone: row.get(5)?,
                    legacy_reference: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(candidates)
    }
}
