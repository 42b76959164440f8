//! Shared fixtures: a disposable legacy database file seeded with
//! alias-variant tables, and helpers to open it the way the engine does.

#![allow(dead_code)]

use std::path::PathBuf;

use rusqlite::Connection;

use legacy_bridge::config::{RetryPolicy, SourceConfig};
use legacy_bridge::source::LegacySource;

/// A temporary database file removed on drop
pub struct TempDb {
    pub path: PathBuf,
}

impl TempDb {
    pub fn path_str(&self) -> &str {
        self.path.to_str().unwrap()
    }

    /// Writable connection for seeding and mutating the fixture
    pub fn connect(&self) -> Connection {
        Connection::open(&self.path).unwrap()
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub fn temp_db(name: &str) -> TempDb {
    let path = std::env::temp_dir().join(format!(
        "legacy-bridge-{name}-{}-{:?}.db",
        std::process::id(),
        std::thread::current().id()
    ));
    let _ = std::fs::remove_file(&path);
    TempDb { path }
}

/// Seed the legacy fixture schema. Table and column names deliberately use
/// alias variants (`bpe`, `patient_no`, `sext1`, `note_text`) so every test
/// exercises the probing path; the notes table has no id column at all.
pub fn seed_legacy_schema(conn: &Connection) {
    conn.execute_batch(
        "CREATE TABLE patients (
            patient_no INTEGER PRIMARY KEY,
            last_name  TEXT NOT NULL,
            forename   TEXT,
            dob        TEXT,
            post_code  TEXT,
            telephone  TEXT
        );
        CREATE TABLE bpe (
            entry_id   INTEGER PRIMARY KEY,
            patient_no INTEGER,
            bpe_date   TEXT,
            entered_at TEXT,
            sext1 INTEGER, sext2 INTEGER, sext3 INTEGER,
            sext4 INTEGER, sext5 INTEGER, sext6 INTEGER
        );
        CREATE TABLE treatments (
            treatment_id   INTEGER PRIMARY KEY,
            patient_no     INTEGER,
            treatment_date TEXT,
            status         TEXT,
            completed      INTEGER,
            tooth          INTEGER,
            surface        INTEGER,
            code           TEXT,
            fee            INTEGER
        );
        CREATE TABLE notes (
            patient_no INTEGER,
            note_date  TEXT,
            note_text  TEXT,
            category   TEXT
        );",
    )
    .unwrap();
}

/// Seed a small consistent practice: two patients with one row per domain
pub fn seed_legacy_rows(conn: &Connection) {
    conn.execute_batch(
        "INSERT INTO patients VALUES
            (1001, 'Hargreaves', 'June', '1961-04-09', 'LS8 2JP', '0113 274 9981'),
            (1002, 'Okafor', 'Daniel', '1988-11-23', 'LS6 1AB', '0113 555 0101');
        INSERT INTO bpe VALUES
            (1, 1001, '2024-01-10T09:30:00', '2024-01-10T09:31:00', 2, 2, 1, 3, 2, 1),
            (2, 1002, '2024-01-11 14:00:00', NULL, 1, 1, 0, 1, 2, 2);
        INSERT INTO treatments VALUES
            (10, 1001, '2024-01-12T10:00:00', 'Completed', 1, 16, 36, 'AMG', 120),
            (11, 1002, '2024-01-13T11:30:00', 'existing', 1, 25, 0, 'CRN', 340),
            (12, 1001, '2024-01-14T09:00:00', 'Planned', 0, 14, 1, 'AMG', 120);
        INSERT INTO notes VALUES
            (1001, '2024-01-10T09:45:00', 'Routine exam, no concerns.', 'exam'),
            (1002, '2024-01-13', 'Crown prep discussed.', NULL);",
    )
    .unwrap();
}

/// Open the seeded fixture the way the engine does: validated, read-only
pub fn open_source(db: &TempDb) -> LegacySource {
    let config = SourceConfig {
        database: db.path_str().to_string(),
        ..SourceConfig::default()
    };
    LegacySource::open(&config, RetryPolicy::default()).unwrap()
}
