/// SQL DDL for the navigation store.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS navigation_sessions (
    session_id TEXT PRIMARY KEY,
    user_id TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    total_frames INTEGER NOT NULL DEFAULT 0,
    total_hazards INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS scene_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    frame_seq INTEGER NOT NULL,
    captured_at TEXT NOT NULL,
    scene_json TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.0,
    clear_path_direction TEXT,
    clear_path_distance_ft REAL
);

CREATE TABLE IF NOT EXISTS hazard_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    hazard_type TEXT NOT NULL,
    direction TEXT,
    distance_feet REAL,
    urgency TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS spatial_landmarks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    label TEXT NOT NULL,
    description TEXT,
    direction TEXT,
    distance_feet REAL,
    frame_seq INTEGER NOT NULL DEFAULT 0,
    lat REAL,
    lon REAL,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    sightings INTEGER NOT NULL DEFAULT 1,
    UNIQUE (session_id, label)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_session ON scene_snapshots(session_id, frame_seq);
CREATE INDEX IF NOT EXISTS idx_hazards_session ON hazard_events(session_id);
CREATE INDEX IF NOT EXISTS idx_landmarks_session ON spatial_landmarks(session_id);
CREATE INDEX IF NOT EXISTS idx_landmarks_label ON spatial_landmarks(label);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
