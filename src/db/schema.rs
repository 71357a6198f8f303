/// Connection settings applied on open.
pub const PRAGMAS: &str = r#"
PRAGMA foreign_keys = ON;
PRAGMA synchronous = FULL;
"#;

/// Schema for the offline queue and the response caches.
pub const SCHEMA: &str = r#"
-- Pending mutating requests. Rows are written once and never updated.
CREATE TABLE IF NOT EXISTS queued_mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    raw_body TEXT,
    headers TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    source TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queued_mutations_order
    ON queued_mutations(created_at, id);

-- Replay bookkeeping kept beside the immutable record
CREATE TABLE IF NOT EXISTS replay_attempts (
    mutation_id INTEGER PRIMARY KEY,
    attempts INTEGER NOT NULL,
    next_attempt_at INTEGER,
    last_error TEXT,
    failed_at INTEGER,
    FOREIGN KEY (mutation_id) REFERENCES queued_mutations(id) ON DELETE CASCADE
);

-- Captured responses, one namespace per versioned cache name
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at INTEGER NOT NULL,
    PRIMARY KEY (cache_name, entry_key)
);
"#;
