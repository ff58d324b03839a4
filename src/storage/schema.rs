//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Starling database.

/// Version stamped into `PRAGMA user_version`
pub const SCHEMA_VERSION: u32 = 1;

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track crawl runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    status TEXT NOT NULL
);

-- One row per repository, keyed by GitHub's node id
CREATE TABLE IF NOT EXISTS repositories (
    stable_id TEXT PRIMARY KEY NOT NULL CHECK (length(stable_id) > 0),
    owner TEXT NOT NULL CHECK (length(owner) > 0),
    name TEXT NOT NULL CHECK (length(name) > 0),
    stargazer_count INTEGER NOT NULL CHECK (stargazer_count >= 0),
    observed_at TEXT NOT NULL,
    crawled_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_repositories_owner_name ON repositories(owner, name);
CREATE INDEX IF NOT EXISTS idx_repositories_stars ON repositories(stargazer_count);
CREATE INDEX IF NOT EXISTS idx_repositories_updated_at ON repositories(updated_at);

-- Last durable cursor per partition
CREATE TABLE IF NOT EXISTS checkpoints (
    partition_id TEXT PRIMARY KEY,
    cursor TEXT,
    state TEXT NOT NULL,
    pages_fetched INTEGER NOT NULL DEFAULT 0,
    records_written INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    updated_at TEXT NOT NULL
);
"#;

/// Upsert used for every repository row
pub const UPSERT_REPOSITORY_SQL: &str = "
    INSERT INTO repositories
        (stable_id, owner, name, stargazer_count, observed_at, crawled_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
    ON CONFLICT(stable_id) DO UPDATE SET
        owner = excluded.owner,
        name = excluded.name,
        stargazer_count = excluded.stargazer_count,
        observed_at = excluded.observed_at,
        updated_at = excluded.updated_at
";

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Reads the schema version stamped into the database
pub fn get_schema_version(conn: &rusqlite::Connection) -> Result<u32, rusqlite::Error> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}
