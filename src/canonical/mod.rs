//! Canonical unification: one entity shape for every legacy domain.
//!
//! Heterogeneous per-domain rows are modelled as a tagged envelope: the
//! domain tag plus identity fields plus a few typed filter fields, with the
//! full normalized snapshot carried as one opaque JSON payload per domain.
//! The shared envelope never grows per-domain columns.

pub mod store;
pub mod sync;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;

pub use store::{CanonicalStore, ImportMarker, RecordFilter, UpsertStats};
pub use sync::{DomainOutcome, DryRunReport, SyncEngine};

use crate::error::{BridgeError, Result};

/// Domain tag for a canonical record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Periodontal screening entries (six sextant scores)
    BpeEntry,
    /// Restorative treatment plan items
    TreatmentPlanItem,
    /// Free-text clinical notes
    ClinicalNote,
}

impl Domain {
    /// Every domain the engine knows how to extract
    pub const ALL: [Domain; 3] = [
        Domain::BpeEntry,
        Domain::TreatmentPlanItem,
        Domain::ClinicalNote,
    ];

    /// Stable tag stored on every canonical record
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::BpeEntry => "bpe_entry",
            Domain::TreatmentPlanItem => "treatment_plan_item",
            Domain::ClinicalNote => "clinical_note",
        }
    }

    /// Parse a stored domain tag
    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "bpe_entry" => Ok(Domain::BpeEntry),
            "treatment_plan_item" => Ok(Domain::TreatmentPlanItem),
            "clinical_note" => Ok(Domain::ClinicalNote),
            other => Err(BridgeError::Data(format!("unknown domain tag '{other}'"))),
        }
    }

    /// Payload fields that participate in the parity digest: the
    /// business-meaningful subset, excluding volatile bookkeeping fields
    /// such as entry timestamps and extraction times.
    #[must_use]
    pub fn digest_fields(self) -> &'static [&'static str] {
        match self {
            Domain::BpeEntry => &[
                "sextant_1", "sextant_2", "sextant_3", "sextant_4", "sextant_5", "sextant_6",
            ],
            Domain::TreatmentPlanItem => &["tooth", "surface", "code", "status", "completed", "fee"],
            Domain::ClinicalNote => &["category", "text"],
        }
    }
}

/// One unified row per logical legacy record.
///
/// `unique_key` derives from the identity fields; one logical source record
/// maps to exactly one stored row no matter how many times it is
/// re-extracted. Rows are created and updated, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    /// Domain tag
    pub domain: Domain,
    /// Name of the legacy system this row came from
    pub source_system: String,
    /// Source record id; synthetic when the source has no stable id
    pub source_record_id: String,
    /// Legacy patient code, when the source row carried one
    pub patient_code: Option<i64>,
    /// Resolved internal patient id, when identity resolution succeeded
    pub patient_id: Option<i64>,
    /// Business timestamp of the record
    pub recorded_at: NaiveDateTime,
    /// Secondary timestamp (when the row was entered into the legacy system)
    pub entered_at: Option<NaiveDateTime>,
    /// Denormalized filter field: tooth number
    pub tooth: Option<i32>,
    /// Denormalized filter field: surface bitmask
    pub surface: Option<i32>,
    /// Denormalized filter field: treatment or entry code
    pub code: Option<String>,
    /// Denormalized filter field: status
    pub status: Option<String>,
    /// Full normalized snapshot of the source row
    pub payload: Value,
    /// When this extraction pass read the row
    pub extracted_at: DateTime<Utc>,
    /// Whether `source_record_id` was derived rather than read from the source
    pub synthetic_id: bool,
}

impl CanonicalRecord {
    /// Patient discriminator: resolved id if known, else legacy code, else
    /// empty. Keeps records from different patients apart even when the
    /// source reuses record ids per patient.
    #[must_use]
    pub fn discriminator(&self) -> String {
        match (self.patient_id, self.patient_code) {
            (Some(id), _) => id.to_string(),
            (None, Some(code)) => code.to_string(),
            (None, None) => String::new(),
        }
    }

    /// Derived storage key: `domain|source_system|source_record_id|discriminator`
    #[must_use]
    pub fn unique_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.domain.as_str(),
            self.source_system,
            self.source_record_id,
            self.discriminator()
        )
    }

    /// Key this record would have carried before its patient mapping
    /// existed. Used at upsert time to re-attach history stored while the
    /// code was still unresolved, instead of duplicating it.
    #[must_use]
    pub fn unresolved_key(&self) -> Option<String> {
        match (self.patient_id, self.patient_code) {
            (Some(_), Some(code)) => Some(format!(
                "{}|{}|{}|{code}",
                self.domain.as_str(),
                self.source_system,
                self.source_record_id,
            )),
            _ => None,
        }
    }

    /// Whether every comparable field matches `other`.
    ///
    /// The extraction timestamp is bookkeeping, not a comparable field;
    /// re-extracting an unchanged row must compare equal.
    #[must_use]
    pub fn comparable_eq(&self, other: &Self) -> bool {
        self.diff(other).is_empty()
    }

    /// Field-level before/after differences against a stored row.
    ///
    /// `self` is the stored state, `other` the incoming one. Payload objects
    /// are diffed one level deep so an update names the business field that
    /// moved, not just "payload".
    #[must_use]
    pub fn diff(&self, other: &Self) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        let mut push = |field: &str, before: Value, after: Value| {
            if before != after {
                changes.push(FieldChange {
                    field: field.to_string(),
                    before,
                    after,
                });
            }
        };

        push("patient_id", json_opt(self.patient_id), json_opt(other.patient_id));
        push("patient_code", json_opt(self.patient_code), json_opt(other.patient_code));
        push(
            "recorded_at",
            Value::String(self.recorded_at.to_string()),
            Value::String(other.recorded_at.to_string()),
        );
        push(
            "entered_at",
            json_opt(self.entered_at.map(|at| at.to_string())),
            json_opt(other.entered_at.map(|at| at.to_string())),
        );
        push("tooth", json_opt(self.tooth), json_opt(other.tooth));
        push("surface", json_opt(self.surface), json_opt(other.surface));
        push("code", json_opt(self.code.clone()), json_opt(other.code.clone()));
        push("status", json_opt(self.status.clone()), json_opt(other.status.clone()));

        changes.extend(diff_payload(&self.payload, &other.payload));
        changes
    }

    /// The restricted business-field view used by parity comparison
    #[must_use]
    pub fn digest(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert(
            "recorded_at".to_string(),
            Value::String(self.recorded_at.to_string()),
        );
        if let Value::Object(payload) = &self.payload {
            for field in self.domain.digest_fields() {
                object.insert(
                    (*field).to_string(),
                    payload.get(*field).cloned().unwrap_or(Value::Null),
                );
            }
        }
        Value::Object(object)
    }
}

/// One changed field in an update, with its before and after values
#[derive(Debug, Clone, Serialize)]
pub struct FieldChange {
    /// Field name; payload fields are prefixed `payload.`
    pub field: String,
    /// Stored value before the update
    pub before: Value,
    /// Incoming value
    pub after: Value,
}

fn json_opt<T: Into<Value>>(value: Option<T>) -> Value {
    value.map_or(Value::Null, Into::into)
}

fn diff_payload(before: &Value, after: &Value) -> Vec<FieldChange> {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut keys: Vec<&String> = b.keys().chain(a.keys()).collect();
            keys.sort();
            keys.dedup();
            keys.into_iter()
                .filter_map(|key| {
                    let old = b.get(key).cloned().unwrap_or(Value::Null);
                    let new = a.get(key).cloned().unwrap_or(Value::Null);
                    (old != new).then(|| FieldChange {
                        field: format!("payload.{key}"),
                        before: old,
                        after: new,
                    })
                })
                .collect()
        }
        _ if before != after => vec![FieldChange {
            field: "payload".to_string(),
            before: before.clone(),
            after: after.clone(),
        }],
        _ => Vec::new(),
    }
}

/// Deterministic synthetic id for a source record with no stable natural
/// identifier, derived from a hash of its natural-key tuple.
///
/// Two logically distinct rows with an identical natural key collapse to
/// the same id; that collision is surfaced through the dry-run
/// `missing_source_id` count rather than resolved here.
#[must_use]
pub fn synthetic_id(natural_key: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in natural_key {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    let hex = hasher.finalize().to_hex();
    format!("syn-{}", &hex[..16])
}
