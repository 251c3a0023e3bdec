/// Schema for the cache, sync queue and agent metadata.
pub const SCHEMA: &str = r#"
-- Cache store: namespace cache:{tier}:{key}
-- Static entries are scoped by agent version; other tiers use version ''
CREATE TABLE IF NOT EXISTS cache_entries (
    tier TEXT NOT NULL,
    version TEXT NOT NULL DEFAULT '',
    cache_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    payload BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    stale_after_secs INTEGER NOT NULL,
    PRIMARY KEY (tier, version, cache_key)
);

-- Sync queue: namespace syncqueue:{taskId}
CREATE TABLE IF NOT EXISTS sync_queue (
    id TEXT PRIMARY KEY,
    seq INTEGER NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    status TEXT NOT NULL,
    next_attempt_at TEXT,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_status_seq ON sync_queue(status, seq);
CREATE INDEX IF NOT EXISTS idx_sync_queue_dedup ON sync_queue(kind, payload_hash, status);

-- Agent metadata (active version)
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
