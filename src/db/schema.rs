/// Schema for the blob store backing both the worker cache and the local store.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per namespace (cache generation, or local store partition).
-- At most one row has active = 1: the generation currently serving requests.
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 0
);

-- Blobs keyed by (namespace, key); cached_at is milliseconds since the epoch
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at INTEGER NOT NULL,
    PRIMARY KEY (namespace, entry_key),
    FOREIGN KEY (namespace) REFERENCES cache_namespaces(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_namespace ON cache_entries(namespace);
"#;
