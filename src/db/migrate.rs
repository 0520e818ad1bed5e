use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS instance (
  instance_id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  contact TEXT NOT NULL DEFAULT '',
  webroot TEXT NOT NULL,
  weburl TEXT NOT NULL DEFAULT '',
  tempdir TEXT NOT NULL,
  interpreter TEXT NOT NULL DEFAULT '',
  app TEXT,
  transport TEXT NOT NULL DEFAULT 'ssh'
);

CREATE TABLE IF NOT EXISTS access (
  instance_id INTEGER NOT NULL REFERENCES instance(instance_id) ON DELETE CASCADE,
  type TEXT NOT NULL CHECK(type IN ('local','ssh','ftp')),
  host TEXT NOT NULL DEFAULT '',
  user TEXT NOT NULL DEFAULT '',
  port INTEGER NOT NULL DEFAULT 22,
  password TEXT
);

CREATE TABLE IF NOT EXISTS version (
  version_id INTEGER PRIMARY KEY AUTOINCREMENT,
  instance_id INTEGER NOT NULL REFERENCES instance(instance_id) ON DELETE CASCADE,
  type TEXT,
  branch TEXT,
  revision TEXT,
  date TEXT
);

CREATE TABLE IF NOT EXISTS file (
  version_id INTEGER NOT NULL REFERENCES version(version_id) ON DELETE CASCADE,
  path TEXT NOT NULL,
  hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backup_location (
  instance_id INTEGER NOT NULL REFERENCES instance(instance_id) ON DELETE CASCADE,
  location TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS property (
  instance_id INTEGER NOT NULL REFERENCES instance(instance_id) ON DELETE CASCADE,
  key TEXT NOT NULL,
  value TEXT NOT NULL,
  PRIMARY KEY (instance_id, key)
);

CREATE INDEX IF NOT EXISTS idx_version_instance ON version(instance_id);
CREATE INDEX IF NOT EXISTS idx_file_version ON file(version_id);
CREATE INDEX IF NOT EXISTS idx_access_instance ON access(instance_id);
"#;

pub fn migrate(conn: &Connection) -> anyhow::Result<()> {
    tracing::info!("applying database schema");
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
