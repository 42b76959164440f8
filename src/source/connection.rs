//! Read-only connection to the legacy source.

use std::cell::RefCell;

use log::info;
use rusqlite::{Connection, OpenFlags};
use rustc_hash::FxHashMap;

use crate::config::{RetryPolicy, SourceConfig};
use crate::error::Result;

/// A validated, read-only handle on the legacy database.
///
/// Holds the per-session column cache used by the probing operations in
/// [`crate::source::columns`]. The engine is a single-threaded batch job, so
/// the cache is a plain `RefCell`.
#[derive(Debug)]
pub struct LegacySource {
    conn: Connection,
    pub(crate) column_cache: RefCell<FxHashMap<String, Vec<String>>>,
    retry: RetryPolicy,
}

impl LegacySource {
    /// Open the legacy source described by `config`.
    ///
    /// Fails before touching the file when the configuration is incomplete,
    /// import is disabled, or the source is not declared read-only. The
    /// underlying connection is opened with the driver's read-only flag, so
    /// no statement issued through this handle can mutate the source.
    pub fn open(config: &SourceConfig, retry: RetryPolicy) -> Result<Self> {
        config.validate()?;

        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&config.database, flags)?;
        conn.busy_timeout(config.busy_timeout)?;
        // Tolerate concurrent writers on the legacy side; we only read.
        conn.pragma_update(None, "read_uncommitted", 1)?;

        info!(
            "opened legacy source '{}' read-only (busy timeout {:?})",
            config.database, config.busy_timeout
        );

        Ok(Self {
            conn,
            column_cache: RefCell::new(FxHashMap::default()),
            retry,
        })
    }

    /// The configured retry policy for transient source errors
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Borrow the underlying read-only connection
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
