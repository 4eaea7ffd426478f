pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

CREATE TABLE IF NOT EXISTS queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    sql TEXT NOT NULL,
    platforms TEXT NOT NULL DEFAULT '',       -- comma-separated, empty means all
    minimum_agent_version TEXT,
    version INTEGER NOT NULL DEFAULT 1,       -- bumped on every edit
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS distributed_queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query_id INTEGER,                         -- source query, kept as a soft link
    query_version INTEGER NOT NULL,
    sql TEXT NOT NULL,
    platforms TEXT NOT NULL DEFAULT '',
    minimum_agent_version TEXT,
    valid_from INTEGER NOT NULL,
    valid_until INTEGER,
    serial_numbers TEXT NOT NULL DEFAULT '[]', -- JSON array, empty means all
    shard INTEGER NOT NULL DEFAULT 100,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS distributed_query_tags (
    distributed_query_id INTEGER NOT NULL,
    tag TEXT NOT NULL,
    UNIQUE (distributed_query_id, tag),
    FOREIGN KEY (distributed_query_id) REFERENCES distributed_queries(id)
);

CREATE TABLE IF NOT EXISTS enrolled_machines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    enrollment_id INTEGER NOT NULL,
    serial_number TEXT NOT NULL,
    node_key TEXT NOT NULL UNIQUE,
    agent_version TEXT,
    platform_mask INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (enrollment_id, serial_number)
);

CREATE INDEX IF NOT EXISTS idx_enrolled_machines_serial
    ON enrolled_machines (serial_number);

CREATE TABLE IF NOT EXISTS machine_tags (
    serial_number TEXT NOT NULL,
    tag TEXT NOT NULL,
    UNIQUE (serial_number, tag)
);

CREATE TABLE IF NOT EXISTS distributed_query_machines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    distributed_query_id INTEGER NOT NULL,
    serial_number TEXT NOT NULL,
    status INTEGER,                           -- NULL until the agent reports back
    error_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (distributed_query_id, serial_number),
    FOREIGN KEY (distributed_query_id) REFERENCES distributed_queries(id)
);

CREATE INDEX IF NOT EXISTS idx_dqm_serial
    ON distributed_query_machines (serial_number);

CREATE TABLE IF NOT EXISTS distributed_query_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    distributed_query_id INTEGER NOT NULL,
    serial_number TEXT NOT NULL,
    row TEXT NOT NULL,                        -- one JSON object per result row
    FOREIGN KEY (distributed_query_id) REFERENCES distributed_queries(id)
);

CREATE INDEX IF NOT EXISTS idx_dqr_query_serial
    ON distributed_query_results (distributed_query_id, serial_number);

CREATE TABLE IF NOT EXISTS pack_queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pack_id INTEGER NOT NULL,
    slug TEXT NOT NULL,
    query_id INTEGER NOT NULL,
    query_version INTEGER NOT NULL,
    UNIQUE (pack_id, slug)
);

CREATE TABLE IF NOT EXISTS carve_sessions (
    id TEXT PRIMARY KEY,                      -- server-generated UUID
    distributed_query_id INTEGER,
    pack_query_id INTEGER,
    serial_number TEXT NOT NULL,
    carve_guid TEXT NOT NULL,
    carve_size INTEGER NOT NULL,
    block_size INTEGER NOT NULL,
    block_count INTEGER NOT NULL,
    completed_at INTEGER,                     -- set exactly once, before dispatch
    archive_path TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_carve_sessions_serial
    ON carve_sessions (serial_number);

CREATE TABLE IF NOT EXISTS carve_blocks (
    session_id TEXT NOT NULL,
    block_id INTEGER NOT NULL,
    size INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (session_id, block_id),
    FOREIGN KEY (session_id) REFERENCES carve_sessions(id)
);

COMMIT;
"#;
