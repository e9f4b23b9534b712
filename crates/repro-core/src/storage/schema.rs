pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS experiments (
  hash TEXT PRIMARY KEY,
  status TEXT NOT NULL,
  parameters_json TEXT,
  log_len INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  last_access TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS uploads (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_hash TEXT NOT NULL REFERENCES experiments(hash),
  filename TEXT NOT NULL,
  submitted_ip TEXT NOT NULL,
  submitted_at TEXT NOT NULL,
  provider_key TEXT
);

CREATE TABLE IF NOT EXISTS build_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_hash TEXT NOT NULL REFERENCES experiments(hash),
  start_offset INTEGER NOT NULL,
  data BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_experiments_status ON experiments(status);
CREATE INDEX IF NOT EXISTS idx_uploads_experiment ON uploads(experiment_hash);
CREATE INDEX IF NOT EXISTS idx_build_log_offset ON build_log(experiment_hash, start_offset);
"#;
