mod schema;

pub use schema::init_database;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

/// Identity resolved from an auth token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub display_name: String,
}

/// Everything needed to rebuild a document's merge state on load.
#[derive(Debug, Default)]
pub struct LoadedDocument {
    /// Most recent snapshot blob, if one exists.
    pub snapshot: Option<Vec<u8>>,
    /// Update entries appended after the snapshot, ascending by clock.
    pub tail: Vec<Vec<u8>>,
    /// Plain text from a database that predates the operation log.
    pub legacy_text: Option<String>,
    /// First unused persistence clock for this document.
    pub next_clock: u64,
}

impl LoadedDocument {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.tail.is_empty() && self.legacy_text.is_none()
    }
}

/// SQLite-backed document and auth storage.
///
/// All writes for one document go through its document actor, so a
/// single mutex-guarded connection is enough; there is no contended
/// hot path behind it.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        init_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Load the snapshot, update tail, and persistence clock for a document.
    pub fn load_document(&self, document_id: &str) -> Result<LoadedDocument, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();

        let snapshot_row: Option<(u64, Vec<u8>)> = conn
            .query_row(
                "SELECT clock, data FROM document_log
                 WHERE document_id = ?1 AND kind = 'snapshot'
                 ORDER BY clock DESC LIMIT 1",
                params![document_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let snapshot_clock = snapshot_row.as_ref().map(|(clock, _)| *clock);
        let snapshot = snapshot_row.map(|(_, data)| data);

        let mut stmt = conn.prepare(
            "SELECT data FROM document_log
             WHERE document_id = ?1 AND kind = 'update' AND clock > ?2
             ORDER BY clock ASC",
        )?;
        let floor = snapshot_clock.map(|c| c as i64).unwrap_or(-1);
        let tail: Vec<Vec<u8>> = stmt
            .query_map(params![document_id, floor], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let max_clock: Option<u64> = conn.query_row(
            "SELECT MAX(clock) FROM document_log WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )?;

        // Only fall back to plain text when the log has never been
        // written for this document.
        let legacy_text = if max_clock.is_none() {
            conn.query_row(
                "SELECT text FROM documents WHERE id = ?1",
                params![document_id],
                |row| row.get(0),
            )
            .optional()?
        } else {
            None
        };

        Ok(LoadedDocument {
            snapshot,
            tail,
            legacy_text,
            next_clock: max_clock.map(|c| c + 1).unwrap_or(0),
        })
    }

    /// Append one update entry and refresh the denormalized text copy
    /// in a single transaction.
    pub fn append_entry(
        &self,
        document_id: &str,
        clock: u64,
        data: &[u8],
        text: &str,
    ) -> Result<(), rusqlite::Error> {
        let mut conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO document_log (document_id, clock, kind, data, created_at)
             VALUES (?1, ?2, 'update', ?3, ?4)",
            params![document_id, clock as i64, data, now],
        )?;
        tx.execute(
            "INSERT INTO documents (id, text, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET text = ?2, updated_at = ?3",
            params![document_id, text, now],
        )?;
        tx.commit()
    }

    /// Replace all entries up to `clock` with one snapshot at `clock`.
    pub fn compact(
        &self,
        document_id: &str,
        snapshot: &[u8],
        clock: u64,
        text: &str,
    ) -> Result<(), rusqlite::Error> {
        let mut conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM document_log WHERE document_id = ?1 AND clock <= ?2",
            params![document_id, clock as i64],
        )?;
        tx.execute(
            "INSERT INTO document_log (document_id, clock, kind, data, created_at)
             VALUES (?1, ?2, 'snapshot', ?3, ?4)",
            params![document_id, clock as i64, snapshot, now],
        )?;
        tx.execute(
            "INSERT INTO documents (id, text, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET text = ?2, updated_at = ?3",
            params![document_id, text, now],
        )?;
        tx.commit()
    }

    /// First unused persistence clock for a document, straight from
    /// the log. Used to resync after another writer claimed a slot.
    pub fn next_clock(&self, document_id: &str) -> Result<u64, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let max_clock: Option<u64> = conn.query_row(
            "SELECT MAX(clock) FROM document_log WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )?;
        Ok(max_clock.map(|c| c + 1).unwrap_or(0))
    }

    /// Number of log entries for a document, snapshots included.
    pub fn log_len(&self, document_id: &str) -> Result<u64, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM document_log WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )
    }

    /// Resolve a bearer token to an identity, honoring expiry.
    pub fn validate_token(&self, token: &str) -> Result<Option<UserIdentity>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, Option<String>, Option<i64>)> = conn
            .query_row(
                "SELECT user_id, display_name, expires_at FROM auth_tokens WHERE token = ?1",
                params![token],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        Ok(row.and_then(|(user_id, display_name, expires_at)| {
            if let Some(expires_at) = expires_at {
                if expires_at <= chrono::Utc::now().timestamp() {
                    return None;
                }
            }
            Some(UserIdentity {
                display_name: display_name.unwrap_or_else(|| user_id.clone()),
                user_id,
            })
        }))
    }

    pub fn insert_token(
        &self,
        token: &str,
        user_id: &str,
        display_name: Option<&str>,
        expires_at: Option<i64>,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO auth_tokens (token, user_id, display_name, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![token, user_id, display_name, expires_at],
        )?;
        Ok(())
    }

    pub fn has_edit_access(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let can_edit: Option<bool> = conn
            .query_row(
                "SELECT can_edit FROM document_access
                 WHERE document_id = ?1 AND user_id = ?2",
                params![document_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(can_edit.unwrap_or(false))
    }

    pub fn grant_access(
        &self,
        user_id: &str,
        document_id: &str,
        can_edit: bool,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO document_access (document_id, user_id, can_edit)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(document_id, user_id) DO UPDATE SET can_edit = ?3",
            params![document_id, user_id, can_edit],
        )?;
        Ok(())
    }
}

#[cfg(test)]
impl Store {
    /// Insert a plain-text documents row with no log entries,
    /// simulating a database that predates the operation log.
    pub fn seed_legacy_text(&self, document_id: &str, text: &str) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO documents (id, text, updated_at) VALUES (?1, ?2, 0)",
            params![document_id, text],
        )
        .unwrap();
    }
}
