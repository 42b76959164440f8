//! Read access to the legacy patient directory.
//!
//! Used by identity bootstrap (fetch the legacy patient behind an unmapped
//! code) and by the offline candidate-scoring tool. Same probing rules as
//! every other extractor: no column name is assumed.

use chrono::NaiveDate;
use rusqlite::types::Value;

use crate::error::Result;
use crate::extract::{value_to_i64, value_to_string};
use crate::source::{LegacySource, quote_ident};

const TABLE_ALIASES: [&str; 3] = ["patients", "patient", "pms_patients"];
const CODE_ALIASES: [&str; 4] = ["patient_code", "patient_no", "pat_code", "code"];
const SURNAME_ALIASES: [&str; 3] = ["surname", "last_name", "lastname"];
const FIRST_ALIASES: [&str; 3] = ["first_name", "forename", "firstname"];
const DOB_ALIASES: [&str; 3] = ["dob", "date_of_birth", "birth_date"];
const POSTCODE_ALIASES: [&str; 3] = ["postcode", "post_code", "zip"];
const PHONE_ALIASES: [&str; 4] = ["phone", "telephone", "mobile", "phone_number"];

/// One row from the legacy patient directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyPatient {
    /// Legacy patient code
    pub code: i64,
    /// Surname as stored
    pub surname: String,
    /// First name, when present
    pub first_name: Option<String>,
    /// Date of birth, when present and parseable
    pub dob: Option<NaiveDate>,
    /// Postcode as stored
    pub postcode: Option<String>,
    /// Phone number as stored
    pub phone: Option<String>,
}

/// Probed accessor for the legacy patients table
pub struct PatientDirectory {
    table: String,
    code_col: String,
    surname_col: String,
    first_col: Option<String>,
    dob_col: Option<String>,
    postcode_col: Option<String>,
    phone_col: Option<String>,
}

impl PatientDirectory {
    /// Probe the patients table; code and surname are required.
    pub fn probe(src: &LegacySource) -> Result<Self> {
        let table = src.resolve_table(&TABLE_ALIASES)?;
        Ok(Self {
            code_col: src.require_column(&table, &CODE_ALIASES)?,
            surname_col: src.require_column(&table, &SURNAME_ALIASES)?,
            first_col: src.pick_column(&table, &FIRST_ALIASES)?,
            dob_col: src.pick_column(&table, &DOB_ALIASES)?,
            postcode_col: src.pick_column(&table, &POSTCODE_ALIASES)?,
            phone_col: src.pick_column(&table, &PHONE_ALIASES)?,
            table,
        })
    }

    fn select_sql(&self) -> String {
        let optional = |col: &Option<String>| {
            col.as_ref()
                .map_or_else(|| "NULL".to_string(), |c| quote_ident(c))
        };
        format!(
            "SELECT {}, {}, {}, {}, {}, {} FROM {}",
            quote_ident(&self.code_col),
            quote_ident(&self.surname_col),
            optional(&self.first_col),
            optional(&self.dob_col),
            optional(&self.postcode_col),
            optional(&self.phone_col),
            quote_ident(&self.table),
        )
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<LegacyPatient>> {
        let code = value_to_i64(&row.get::<_, Value>(0)?);
        let surname = value_to_string(&row.get::<_, Value>(1)?);
        let (Some(code), Some(surname)) = (code, surname) else {
            return Ok(None);
        };
        let dob = value_to_string(&row.get::<_, Value>(3)?)
            .and_then(|raw| super::parse_source_datetime(&raw))
            .map(|at| at.date());
        Ok(Some(LegacyPatient {
            code,
            surname,
            first_name: value_to_string(&row.get::<_, Value>(2)?),
            dob,
            postcode: value_to_string(&row.get::<_, Value>(4)?),
            phone: value_to_string(&row.get::<_, Value>(5)?),
        }))
    }

    /// Fetch one legacy patient by code
    pub fn fetch_by_code(&self, src: &LegacySource, code: i64) -> Result<Option<LegacyPatient>> {
        let sql = format!(
            "{} WHERE {} = ? LIMIT 1",
            self.select_sql(),
            quote_ident(&self.code_col)
        );
        let policy = src.retry_policy();
        crate::source::run_with_retry(&policy, || {
            let mut stmt = src.connection().prepare(&sql)?;
            let mut rows = stmt.query([code])?;
            match rows.next()? {
                Some(row) => Ok(Self::from_row(row)?),
                None => Ok(None),
            }
        })
    }

    /// Fetch legacy patients for an explicit code list, one round-trip per
    /// bounded chunk.
    pub fn fetch_by_codes(
        &self,
        src: &LegacySource,
        codes: &[i64],
        chunk_size: usize,
    ) -> Result<Vec<LegacyPatient>> {
        let policy = src.retry_policy();
        let mut out = Vec::new();
        for chunk in codes.chunks(chunk_size.max(1)) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "{} WHERE {} IN ({placeholders}) ORDER BY {} ASC",
                self.select_sql(),
                quote_ident(&self.code_col),
                quote_ident(&self.code_col),
            );
            let mut page = crate::source::run_with_retry(&policy, || {
                let mut stmt = src.connection().prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(chunk.iter()))?;
                let mut page = Vec::new();
                while let Some(row) = rows.next()? {
                    if let Some(patient) = Self::from_row(row)? {
                        page.push(patient);
                    }
                }
                Ok(page)
            })?;
            out.append(&mut page);
        }
        Ok(out)
    }
}
