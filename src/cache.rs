// 🗄️ Parse Cache - SQLite store of already-parsed spreadsheets
//
// Keyed by file path plus a SHA-256 of the file bytes and loader settings, so
// an edited file or a changed column mapping is always re-parsed.

use crate::error::AnalysisResult;
use crate::parser::{LoaderSettings, ParsedSheet};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::cell::Cell;
use std::fs;
use std::path::Path;
use tracing::debug;

pub struct ParseCache {
    conn: Connection,
    hits: Cell<u64>,
    misses: Cell<u64>,
}

/// One cached entry, as stored
#[derive(Debug, Clone)]
pub struct CachedSheet {
    pub sheet: ParsedSheet,
    pub parsed_at: DateTime<Utc>,
}

impl ParseCache {
    /// Open (or create) the cache database at `path`
    pub fn open(path: &Path) -> AnalysisResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> AnalysisResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> AnalysisResult<Self> {
        setup_cache(&conn)?;
        Ok(ParseCache {
            conn,
            hits: Cell::new(0),
            misses: Cell::new(0),
        })
    }

    /// Cached sheet for `file` when its content hash still matches
    pub fn get(&self, file: &str, content_hash: &str) -> AnalysisResult<Option<CachedSheet>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT sheet_json, parsed_at FROM parsed_sheets
                 WHERE file_path = ?1 AND content_hash = ?2",
                params![file, content_hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((json, parsed_at)) => {
                self.hits.set(self.hits.get() + 1);
                let sheet: ParsedSheet = serde_json::from_str(&json)?;
                // Unreadable timestamps only lose metadata, not the entry
                let parsed_at = DateTime::parse_from_rfc3339(&parsed_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                debug!(file, "parse cache hit");
                Ok(Some(CachedSheet { sheet, parsed_at }))
            }
            None => {
                self.misses.set(self.misses.get() + 1);
                Ok(None)
            }
        }
    }

    /// Store (or replace) the parsed sheet for `file`
    pub fn put(&self, file: &str, content_hash: &str, sheet: &ParsedSheet) -> AnalysisResult<()> {
        let json = serde_json::to_string(sheet)?;
        self.conn.execute(
            "INSERT INTO parsed_sheets (file_path, content_hash, sheet_json, parsed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(file_path) DO UPDATE SET
                content_hash = excluded.content_hash,
                sheet_json = excluded.sheet_json,
                parsed_at = excluded.parsed_at",
            params![file, content_hash, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn len(&self) -> AnalysisResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM parsed_sheets", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> AnalysisResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn hits(&self) -> u64 {
        self.hits.get()
    }

    pub fn misses(&self) -> u64 {
        self.misses.get()
    }
}

fn setup_cache(conn: &Connection) -> AnalysisResult<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS parsed_sheets (
            file_path TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            sheet_json TEXT NOT NULL,
            parsed_at TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// SHA-256 over the file bytes and everything that changes how they parse
pub fn content_hash(bytes: &[u8], settings: &LoaderSettings) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let c = &settings.columns;
    hasher.update(
        format!(
            "|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            settings.data_start_row,
            c.info_code,
            c.pan,
            c.party_name,
            c.taxpayer_type,
            c.amount,
            c.business_nature,
            c.turnover_range,
            c.income_range
        )
        .as_bytes(),
    );
    format!("{:x}", hasher.finalize())
}
