/// SQL DDL for the presence database.
/// WAL mode enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS presence (
    user_id TEXT NOT NULL,
    board_id TEXT NOT NULL,
    last_seen_ms INTEGER NOT NULL,
    current_activity TEXT,
    PRIMARY KEY (user_id, board_id)
);

CREATE INDEX IF NOT EXISTS idx_presence_board ON presence(board_id);
CREATE INDEX IF NOT EXISTS idx_presence_last_seen ON presence(last_seen_ms);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
