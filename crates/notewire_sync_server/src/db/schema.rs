use rusqlite::Connection;

/// SQL schema for document persistence and the auth/access tables.
const SCHEMA: &str = r#"
-- Denormalized plain-text copy of each document, readable by
-- non-CRDT consumers (search, legacy readers). Doubles as the
-- migration seed for documents that predate the operation log.
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    text TEXT NOT NULL DEFAULT '',
    updated_at INTEGER NOT NULL
);

-- Append-only operation log. clock is a per-document monotonic
-- counter, not wall-clock time, so rapid saves can never collide.
CREATE TABLE IF NOT EXISTS document_log (
    document_id TEXT NOT NULL,
    clock INTEGER NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('update', 'snapshot')),
    data BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (document_id, clock)
);

CREATE INDEX IF NOT EXISTS idx_document_log_kind ON document_log(document_id, kind);

-- Bearer tokens for the reference authenticator.
CREATE TABLE IF NOT EXISTS auth_tokens (
    token TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    display_name TEXT,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_auth_tokens_user ON auth_tokens(user_id);

-- Per-document access grants for the reference access control.
CREATE TABLE IF NOT EXISTS document_access (
    document_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    can_edit INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (document_id, user_id)
);
"#;

/// Initialize the database schema.
pub fn init_database(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)?;

    // Forward migration for databases created before display_name.
    let has_display_name: bool = conn
        .prepare("PRAGMA table_info(auth_tokens)")?
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(Result::ok)
        .any(|name| name == "display_name");
    if !has_display_name {
        conn.execute("ALTER TABLE auth_tokens ADD COLUMN display_name TEXT", [])?;
    }

    Ok(())
}
