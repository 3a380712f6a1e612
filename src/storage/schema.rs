use rusqlite::Connection;

pub mod tables {
    pub const TRACKS: &str = "tracks";
    pub const TRACK_VERSIONS: &str = "track_versions";
    pub const COMMENTS: &str = "comments";

    pub const ALL_TABLES: &[&str] = &[TRACKS, TRACK_VERSIONS, COMMENTS];
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tracks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    visibility TEXT NOT NULL DEFAULT 'private',
    version TEXT NOT NULL,
    file_url TEXT NOT NULL,
    duration REAL,
    waveform_data TEXT,
    pinned_version_id INTEGER REFERENCES track_versions(id),
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS track_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    track_id INTEGER NOT NULL REFERENCES tracks(id),
    version_number INTEGER NOT NULL CHECK (version_number > 0),
    title TEXT,
    description TEXT,
    file_url TEXT NOT NULL,
    filename TEXT NOT NULL,
    duration REAL,
    waveform_data TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE (track_id, version_number)
);

CREATE TABLE IF NOT EXISTS comments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    track_id INTEGER NOT NULL REFERENCES tracks(id),
    user_id TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp REAL,
    version TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS comments_by_track ON comments (track_id, id);

CREATE TRIGGER IF NOT EXISTS comments_version_immutable
BEFORE UPDATE OF version ON comments
WHEN NEW.version IS NOT OLD.version
BEGIN
    SELECT RAISE(ABORT, 'comment version label is immutable');
END;
"#;

pub fn init(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)
}
