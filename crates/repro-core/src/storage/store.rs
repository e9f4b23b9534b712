use crate::errors::{ReproError, Result};
use crate::model::{BuildParameters, BuildStatus, ContentHash, Experiment, LogChunk, Upload};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Result of a guarded status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome<T = ()> {
    Applied(T),
    /// The experiment exists but was not in an accepted source state.
    Rejected(BuildStatus),
    Missing,
}

impl<T> CasOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}

#[derive(Clone)]
pub struct Store {
    pub conn: Arc<Mutex<Connection>>,
}

pub struct StoreStats {
    pub experiments: u64,
    pub uploads: u64,
    pub by_status: Vec<(BuildStatus, u64)>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(crate::storage::schema::DDL)?;
        migrate_provider_key(&conn)?;
        Ok(())
    }

    /// Runs `f` on the blocking pool. Async callers go through here so a
    /// database held by a builder process does not stall a runtime worker.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| ReproError::storage(format!("store task failed: {e}")))?
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ReproError::storage("store mutex poisoned"))
    }

    /// Creates the experiment (NOBUILD) if absent and records the upload, in
    /// one transaction. Returns whether this call created the experiment.
    pub fn insert_experiment_with_upload(
        &self,
        hash: &ContentHash,
        filename: &str,
        submitted_ip: &str,
        provider_key: Option<&str>,
    ) -> Result<(Experiment, Upload, bool)> {
        let now = now_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let created = insert_or_touch(&tx, hash, &now)?;
        let upload = insert_upload(&tx, hash, filename, submitted_ip, provider_key, &now)?;
        let experiment = select_experiment(&tx, hash)?
            .ok_or_else(|| ReproError::storage("experiment vanished inside transaction"))?;
        tx.commit()?;
        Ok((experiment, upload, created))
    }

    /// Creates the experiment (NOBUILD) or refreshes its last-access time.
    /// Returns whether this call created it.
    pub fn ensure_experiment(&self, hash: &ContentHash) -> Result<bool> {
        let now = now_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let created = insert_or_touch(&tx, hash, &now)?;
        tx.commit()?;
        Ok(created)
    }

    pub fn record_upload(
        &self,
        hash: &ContentHash,
        filename: &str,
        submitted_ip: &str,
        provider_key: Option<&str>,
    ) -> Result<Upload> {
        let now = now_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if select_status(&tx, hash)?.is_none() {
            return Err(ReproError::not_found(format!("experiment {hash}")));
        }
        let upload = insert_upload(&tx, hash, filename, submitted_ip, provider_key, &now)?;
        tx.commit()?;
        Ok(upload)
    }

    pub fn get_experiment(&self, hash: &ContentHash) -> Result<Option<Experiment>> {
        let conn = self.lock()?;
        select_experiment(&conn, hash)
    }

    /// Reads the experiment and refreshes its last-access time.
    pub fn touch_experiment(&self, hash: &ContentHash) -> Result<Option<Experiment>> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE experiments SET last_access = ?2 WHERE hash = ?1",
            params![hash.as_str(), now_rfc3339()],
        )?;
        if n == 0 {
            return Ok(None);
        }
        select_experiment(&conn, hash)
    }

    pub fn uploads_for(&self, hash: &ContentHash) -> Result<Vec<Upload>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, experiment_hash, filename, submitted_ip, submitted_at, provider_key
             FROM uploads WHERE experiment_hash = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![hash.as_str()], row_to_upload)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn hashes_with_status(&self, status: BuildStatus) -> Result<Vec<ContentHash>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT hash FROM experiments WHERE status = ?1 ORDER BY created_at ASC, hash ASC",
        )?;
        let rows = stmt.query_map(params![status.as_str()], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(ContentHash::parse(&r?)?);
        }
        Ok(out)
    }

    /// Single guarded statement: moves `from -> to` or reports the current state.
    pub fn compare_and_set_status(
        &self,
        hash: &ContentHash,
        from: BuildStatus,
        to: BuildStatus,
    ) -> Result<CasOutcome> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE experiments SET status = ?3 WHERE hash = ?1 AND status = ?2",
            params![hash.as_str(), from.as_str(), to.as_str()],
        )?;
        if n == 1 {
            return Ok(CasOutcome::Applied(()));
        }
        Ok(match select_status(&conn, hash)? {
            Some(current) => CasOutcome::Rejected(current),
            None => CasOutcome::Missing,
        })
    }

    /// QUEUED -> BUILDING, dropping any log and parameters from an earlier
    /// attempt. With `restart`, BUILDING -> BUILDING is accepted too. Returns
    /// the previous status.
    pub fn begin_building(
        &self,
        hash: &ContentHash,
        restart: bool,
    ) -> Result<CasOutcome<BuildStatus>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = match select_status(&tx, hash)? {
            Some(s) => s,
            None => return Ok(CasOutcome::Missing),
        };
        let accepted = match current {
            BuildStatus::Queued => true,
            BuildStatus::Building => restart,
            _ => false,
        };
        if !accepted {
            return Ok(CasOutcome::Rejected(current));
        }
        tx.execute(
            "DELETE FROM build_log WHERE experiment_hash = ?1",
            params![hash.as_str()],
        )?;
        tx.execute(
            "UPDATE experiments
             SET status = ?2, log_len = 0, parameters_json = NULL
             WHERE hash = ?1",
            params![hash.as_str(), BuildStatus::Building.as_str()],
        )?;
        tx.commit()?;
        Ok(CasOutcome::Applied(current))
    }

    /// Appends to the log while BUILDING. Returns the new log length.
    pub fn append_log(&self, hash: &ContentHash, data: &[u8]) -> Result<CasOutcome<u64>> {
        self.append_guarded(hash, data, &[BuildStatus::Building], None)
    }

    /// BUILDING -> BUILT with the build's parameters.
    pub fn mark_built(
        &self,
        hash: &ContentHash,
        parameters: &BuildParameters,
    ) -> Result<CasOutcome> {
        let json = serde_json::to_string(parameters)?;
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE experiments SET status = ?3, parameters_json = ?4
             WHERE hash = ?1 AND status = ?2",
            params![
                hash.as_str(),
                BuildStatus::Building.as_str(),
                BuildStatus::Built.as_str(),
                json
            ],
        )?;
        if n == 1 {
            return Ok(CasOutcome::Applied(()));
        }
        Ok(match select_status(&conn, hash)? {
            Some(current) => CasOutcome::Rejected(current),
            None => CasOutcome::Missing,
        })
    }

    /// QUEUED or BUILDING -> ERROR, appending `diagnostic` to the log.
    pub fn mark_error(&self, hash: &ContentHash, diagnostic: &[u8]) -> Result<CasOutcome<u64>> {
        self.append_guarded(
            hash,
            diagnostic,
            &[BuildStatus::Queued, BuildStatus::Building],
            Some(BuildStatus::Error),
        )
    }

    fn append_guarded(
        &self,
        hash: &ContentHash,
        data: &[u8],
        accepted: &[BuildStatus],
        then: Option<BuildStatus>,
    ) -> Result<CasOutcome<u64>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(String, i64)> = tx
            .query_row(
                "SELECT status, log_len FROM experiments WHERE hash = ?1",
                params![hash.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (status, log_len) = match row {
            Some((s, len)) => (parse_status(&s)?, len),
            None => return Ok(CasOutcome::Missing),
        };
        if !accepted.contains(&status) {
            return Ok(CasOutcome::Rejected(status));
        }

        let mut new_len = log_len;
        if !data.is_empty() {
            tx.execute(
                "INSERT INTO build_log (experiment_hash, start_offset, data) VALUES (?1, ?2, ?3)",
                params![hash.as_str(), log_len, data],
            )?;
            new_len += data.len() as i64;
        }
        let next_status = then.unwrap_or(status);
        tx.execute(
            "UPDATE experiments SET log_len = ?2, status = ?3 WHERE hash = ?1",
            params![hash.as_str(), new_len, next_status.as_str()],
        )?;
        tx.commit()?;
        Ok(CasOutcome::Applied(new_len as u64))
    }

    /// Log bytes from `from` to the current end. `None` if the experiment is unknown.
    pub fn read_log(&self, hash: &ContentHash, from: u64) -> Result<Option<LogChunk>> {
        let conn = self.lock()?;
        let log_len: Option<i64> = conn
            .query_row(
                "SELECT log_len FROM experiments WHERE hash = ?1",
                params![hash.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(log_len) = log_len else {
            return Ok(None);
        };
        let log_len = log_len as u64;
        if from >= log_len {
            return Ok(Some(LogChunk {
                data: Vec::new(),
                offset: log_len.min(from),
                next_offset: log_len,
            }));
        }

        let mut stmt = conn.prepare(
            "SELECT start_offset, data FROM build_log
             WHERE experiment_hash = ?1 AND start_offset + length(data) > ?2
             ORDER BY start_offset ASC",
        )?;
        let rows = stmt.query_map(params![hash.as_str(), from as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut data = Vec::with_capacity((log_len - from) as usize);
        for r in rows {
            let (start, chunk) = r?;
            let skip = from.saturating_sub(start as u64) as usize;
            data.extend_from_slice(&chunk[skip.min(chunk.len())..]);
        }
        Ok(Some(LogChunk {
            data,
            offset: from,
            next_offset: log_len,
        }))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let experiments: i64 =
            conn.query_row("SELECT COUNT(*) FROM experiments", [], |r| r.get(0))?;
        let uploads: i64 = conn.query_row("SELECT COUNT(*) FROM uploads", [], |r| r.get(0))?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM experiments GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        let mut by_status = Vec::new();
        for r in rows {
            let (s, n) = r?;
            by_status.push((parse_status(&s)?, n as u64));
        }
        Ok(StoreStats {
            experiments: experiments as u64,
            uploads: uploads as u64,
            by_status,
        })
    }

    pub fn count_rows(&self, table: &str) -> Result<i64> {
        let conn = self.lock()?;
        let n = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
        Ok(n)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_status(s: &str) -> Result<BuildStatus> {
    s.parse()
        .map_err(|e: String| ReproError::storage(format!("corrupt experiments row: {e}")))
}

fn insert_or_touch(conn: &Connection, hash: &ContentHash, now: &str) -> Result<bool> {
    let created = conn.execute(
        "INSERT INTO experiments (hash, status, log_len, created_at, last_access)
         VALUES (?1, ?2, 0, ?3, ?3)
         ON CONFLICT(hash) DO NOTHING",
        params![hash.as_str(), BuildStatus::NoBuild.as_str(), now],
    )? == 1;
    if !created {
        conn.execute(
            "UPDATE experiments SET last_access = ?2 WHERE hash = ?1",
            params![hash.as_str(), now],
        )?;
    }
    Ok(created)
}

fn insert_upload(
    conn: &Connection,
    hash: &ContentHash,
    filename: &str,
    submitted_ip: &str,
    provider_key: Option<&str>,
    now: &str,
) -> Result<Upload> {
    conn.execute(
        "INSERT INTO uploads (experiment_hash, filename, submitted_ip, submitted_at, provider_key)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![hash.as_str(), filename, submitted_ip, now, provider_key],
    )?;
    Ok(Upload {
        id: conn.last_insert_rowid(),
        experiment_hash: hash.clone(),
        filename: filename.to_string(),
        submitted_ip: submitted_ip.to_string(),
        submitted_at: now.to_string(),
        provider_key: provider_key.map(str::to_string),
    })
}

/// Databases created before provider ingestion lack `uploads.provider_key`.
fn migrate_provider_key(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(uploads)")?;
    let cols = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for col in cols {
        if col? == "provider_key" {
            return Ok(());
        }
    }
    conn.execute("ALTER TABLE uploads ADD COLUMN provider_key TEXT", [])?;
    Ok(())
}

fn select_status(conn: &Connection, hash: &ContentHash) -> Result<Option<BuildStatus>> {
    let s: Option<String> = conn
        .query_row(
            "SELECT status FROM experiments WHERE hash = ?1",
            params![hash.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    s.as_deref().map(parse_status).transpose()
}

fn select_experiment(conn: &Connection, hash: &ContentHash) -> Result<Option<Experiment>> {
    let row = conn
        .query_row(
            "SELECT status, parameters_json, log_len, created_at, last_access
             FROM experiments WHERE hash = ?1",
            params![hash.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((status, params_json, log_len, created_at, last_access)) = row else {
        return Ok(None);
    };
    let parameters = match params_json {
        Some(s) if !s.trim().is_empty() => serde_json::from_str(&s)?,
        _ => BuildParameters::new(),
    };
    Ok(Some(Experiment {
        hash: hash.clone(),
        status: parse_status(&status)?,
        parameters,
        log_len: log_len as u64,
        created_at,
        last_access,
    }))
}

fn row_to_upload(row: &rusqlite::Row<'_>) -> rusqlite::Result<Upload> {
    let hash: String = row.get(1)?;
    let experiment_hash = ContentHash::parse(&hash).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Upload {
        id: row.get(0)?,
        experiment_hash,
        filename: row.get(2)?,
        submitted_ip: row.get(3)?,
        submitted_at: row.get(4)?,
        provider_key: row.get(5)?,
    })
}
