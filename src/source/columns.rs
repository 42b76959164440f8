//! Schema probing: discover what a deployment actually calls its columns.
//!
//! Legacy deployments drift; the same logical field may be `tooth`,
//! `tooth_number`, or `tth` depending on the site's upgrade history. Each
//! feature declares its candidate aliases in preference order and asks for
//! the first one that exists. Probe results are cached per table for the
//! session.

use log::debug;

use crate::error::{BridgeError, Result};
use crate::source::connection::LegacySource;
use crate::source::quote_ident;

impl LegacySource {
    /// Ordered list of existing column names for `table`, cached per session.
    pub fn discover_columns(&self, table: &str) -> Result<Vec<String>> {
        if let Some(columns) = self.column_cache.borrow().get(table) {
            return Ok(columns.clone());
        }

        let sql = format!("PRAGMA table_info({})", quote_ident(table));
        let mut stmt = self.connection().prepare(&sql)?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        debug!("probed {}: {} column(s)", table, columns.len());
        self.column_cache
            .borrow_mut()
            .insert(table.to_string(), columns.clone());
        Ok(columns)
    }

    /// First candidate column present in `table`, or `None`.
    ///
    /// Matching is case-insensitive; the returned name is the one the
    /// deployment actually uses, so it can go straight into composed SQL.
    pub fn pick_column(&self, table: &str, candidates: &[&str]) -> Result<Option<String>> {
        let existing = self.discover_columns(table)?;
        for candidate in candidates {
            if let Some(name) = existing
                .iter()
                .find(|col| col.eq_ignore_ascii_case(candidate))
            {
                return Ok(Some(name.clone()));
            }
        }
        Ok(None)
    }

    /// Like [`Self::pick_column`], but fails fast when no candidate exists.
    ///
    /// Used when a feature is unusable without the column; the error names
    /// the table and every alias tried so an operator can extend the alias
    /// list for a new deployment in one pass.
    pub fn require_column(&self, table: &str, candidates: &[&str]) -> Result<String> {
        self.pick_column(table, candidates)?
            .ok_or_else(|| BridgeError::SchemaDrift {
                table: table.to_string(),
                aliases: candidates.iter().map(|c| (*c).to_string()).collect(),
            })
    }

    /// First candidate table present in the source, or a fatal error naming
    /// every alias tried.
    pub fn resolve_table(&self, candidates: &[&str]) -> Result<String> {
        let mut stmt = self
            .connection()
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        for candidate in candidates {
            if let Some(name) = tables
                .iter()
                .find(|table| table.eq_ignore_ascii_case(candidate))
            {
                return Ok(name.clone());
            }
        }
        Err(BridgeError::MissingTable {
            aliases: candidates.iter().map(|c| (*c).to_string()).collect(),
        })
    }
}
