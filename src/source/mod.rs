//! Extraction-layer plumbing for the read-only legacy source.
//!
//! The legacy store's column names vary by deployment, so nothing in this
//! module binds to a column at compile time: callers probe for the columns
//! they need ([`LegacySource::pick_column`] / [`LegacySource::require_column`])
//! and compose queries from whatever is actually present.
//!
//! Nothing here ever issues a mutating statement; the connection itself is
//! opened read-only at the protocol level.

pub mod columns;
pub mod connection;
pub mod query;
pub mod retry;

pub use connection::LegacySource;
pub use query::{Cursor, ExtractBounds, RowStream, TableQuery};
pub use retry::run_with_retry;

/// Quote an identifier for inclusion in composed SQL.
///
/// Identifiers come from probe results or internal constants, never from
/// user input, but quoting keeps reserved words and odd legacy names safe.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
