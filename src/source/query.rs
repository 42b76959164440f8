//! Query composition and cursor pagination over probed columns.
//!
//! Every domain listing operation is expressed as a [`TableQuery`]: the
//! probed table and column names plus the two columns that define extraction
//! order, the patient code and a stable business key. Pagination is by
//! cursor (last seen key tuple), never by offset, so extraction scales to
//! large tables and a stream can be restarted from any cursor position.

use std::collections::VecDeque;

use rusqlite::Row;
use rusqlite::types::Value;

use crate::config::DateWindow;
use crate::error::Result;
use crate::source::connection::LegacySource;
use crate::source::quote_ident;
use crate::source::retry::run_with_retry;

/// Format used when binding timestamps into composed SQL; matches the
/// driver's own text encoding so comparisons stay lexicographic.
const SQL_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Bind a timestamp as a SQL parameter
#[must_use]
pub fn datetime_param(at: chrono::NaiveDateTime) -> Value {
    Value::Text(at.format(SQL_DATETIME_FORMAT).to_string())
}

/// Optional bounds on a domain listing operation
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractBounds {
    /// Inclusive patient-code range
    pub code_range: Option<(i64, i64)>,
    /// Half-open business-date window
    pub window: Option<DateWindow>,
}

/// Position after the last seen row: its (patient code, business key) tuple.
///
/// Patient code is nullable in drifted sources; null-coded rows sort first
/// and the cursor predicate accounts for both forms.
#[derive(Debug, Clone)]
pub struct Cursor {
    /// Patient code of the last seen row, if present
    pub code: Option<i64>,
    /// Business key of the last seen row
    pub key: Value,
}

/// A parameterized listing query composed from probed columns only
#[derive(Debug, Clone)]
pub struct TableQuery {
    /// Actual table name in this deployment
    pub table: String,
    /// Actual patient-code column name
    pub patient_col: String,
    /// Stable business-key column used for ordering and cursoring
    pub key_col: String,
    /// Business-date column, when the domain has one
    pub date_col: Option<String>,
    /// Domain columns selected after the patient/key pair
    pub columns: Vec<String>,
}

impl TableQuery {
    /// Positional offset of the first domain column in the select list.
    /// Row mappers index their columns relative to this.
    pub const DOMAIN_OFFSET: usize = 2;

    fn select_list(&self) -> String {
        let mut parts = vec![quote_ident(&self.patient_col), quote_ident(&self.key_col)];
        parts.extend(self.columns.iter().map(|c| quote_ident(c)));
        parts.join(", ")
    }

    fn push_window(&self, sql: &mut String, params: &mut Vec<Value>, window: &DateWindow) {
        if let Some(date_col) = &self.date_col {
            // Null-dated rows stay visible so they can be counted as
            // missing-date drops instead of silently vanishing.
            let d = quote_ident(date_col);
            sql.push_str(&format!(" AND ({d} IS NULL OR ({d} >= ? AND {d} < ?))"));
            params.push(datetime_param(window.from));
            params.push(datetime_param(window.to));
        }
    }

    fn page_sql(&self, bounds: &ExtractBounds, cursor: Option<&Cursor>) -> (String, Vec<Value>) {
        let p = quote_ident(&self.patient_col);
        let k = quote_ident(&self.key_col);
        let mut sql = format!(
            "SELECT {} FROM {} WHERE 1 = 1",
            self.select_list(),
            quote_ident(&self.table)
        );
        let mut params: Vec<Value> = Vec::new();

        if let Some((low, high)) = bounds.code_range {
            sql.push_str(&format!(" AND {p} >= ? AND {p} <= ?"));
            params.push(Value::Integer(low));
            params.push(Value::Integer(high));
        }
        if let Some(window) = &bounds.window {
            self.push_window(&mut sql, &mut params, window);
        }
        match cursor {
            Some(Cursor { code: Some(code), key }) => {
                sql.push_str(&format!(" AND ({p} > ? OR ({p} = ? AND {k} > ?))"));
                params.push(Value::Integer(*code));
                params.push(Value::Integer(*code));
                params.push(key.clone());
            }
            Some(Cursor { code: None, key }) => {
                // Still inside the leading null-code group.
                sql.push_str(&format!(" AND ({p} IS NOT NULL OR {k} > ?)"));
                params.push(key.clone());
            }
            None => {}
        }

        sql.push_str(&format!(" ORDER BY {p} ASC, {k} ASC LIMIT ?"));
        (sql, params)
    }

    /// Fetch one page of typed rows after `cursor`, with transient-error
    /// retry. Returns each row paired with its cursor position.
    pub fn fetch_page<T>(
        &self,
        src: &LegacySource,
        bounds: &ExtractBounds,
        cursor: Option<&Cursor>,
        limit: usize,
        map: &mut dyn FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<(Cursor, T)>> {
        let (sql, mut params) = self.page_sql(bounds, cursor);
        params.push(Value::Integer(limit as i64));
        let policy = src.retry_policy();

        run_with_retry(&policy, || {
            let mut stmt = src.connection().prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut page = Vec::new();
            while let Some(row) = rows.next()? {
                let position = Cursor {
                    code: row.get::<_, Option<i64>>(0)?,
                    key: row.get::<_, Value>(1)?,
                };
                let item = map(row)?;
                page.push((position, item));
            }
            Ok(page)
        })
    }

    /// Fetch rows for an explicit patient-code list, one round-trip per
    /// bounded chunk, so a single slow or failing chunk never forces a
    /// re-scan of the whole set.
    pub fn fetch_for_codes<T>(
        &self,
        src: &LegacySource,
        codes: &[i64],
        window: Option<&DateWindow>,
        chunk_size: usize,
        map: &mut dyn FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let p = quote_ident(&self.patient_col);
        let k = quote_ident(&self.key_col);
        let policy = src.retry_policy();
        let mut out = Vec::new();

        for chunk in codes.chunks(chunk_size.max(1)) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut sql = format!(
                "SELECT {} FROM {} WHERE {p} IN ({placeholders})",
                self.select_list(),
                quote_ident(&self.table)
            );
            let mut params: Vec<Value> =
                chunk.iter().map(|code| Value::Integer(*code)).collect();
            if let Some(window) = window {
                self.push_window(&mut sql, &mut params, window);
            }
            sql.push_str(&format!(" ORDER BY {p} ASC, {k} ASC"));

            let mut rows = run_with_retry(&policy, || {
                let mut stmt = src.connection().prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
                let mut page = Vec::new();
                while let Some(row) = rows.next()? {
                    page.push(map(row)?);
                }
                Ok(page)
            })?;
            out.append(&mut rows);
        }
        Ok(out)
    }

    /// Lazy, ordered, restartable stream of typed rows
    pub fn stream<'a, T, F>(
        &'a self,
        src: &'a LegacySource,
        bounds: ExtractBounds,
        batch_size: usize,
        start_after: Option<Cursor>,
        map: F,
    ) -> RowStream<'a, T, F>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        RowStream {
            query: self,
            src,
            bounds,
            batch_size: batch_size.max(1),
            map,
            cursor: start_after,
            buffer: VecDeque::new(),
            exhausted: false,
            failed: false,
        }
    }
}

/// Iterator over typed rows, fetching one page per source round-trip.
///
/// The stream records the cursor of the last row it pulled, so an
/// interrupted extraction can be restarted from [`RowStream::cursor`]
/// without rescanning earlier pages.
pub struct RowStream<'a, T, F> {
    query: &'a TableQuery,
    src: &'a LegacySource,
    bounds: ExtractBounds,
    batch_size: usize,
    map: F,
    cursor: Option<Cursor>,
    buffer: VecDeque<(Cursor, T)>,
    exhausted: bool,
    failed: bool,
}

impl<T, F> RowStream<'_, T, F> {
    /// Position after the last row handed out, for restart
    #[must_use]
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }
}

impl<T, F> Iterator for RowStream<'_, T, F>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            let page = self.query.fetch_page(
                self.src,
                &self.bounds,
                self.cursor.as_ref(),
                self.batch_size,
                &mut self.map,
            );
            match page {
                Ok(page) => {
                    if page.len() < self.batch_size {
                        self.exhausted = true;
                    }
                    self.buffer.extend(page);
                    if self.buffer.is_empty() {
                        return None;
                    }
                }
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
        let (position, item) = self.buffer.pop_front()?;
        self.cursor = Some(position);
        Some(Ok(item))
    }
}
