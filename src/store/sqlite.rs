use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::sync::{Mutex, MutexGuard};

use super::{PullStore, StoreError};
use crate::pr::{carry_reported, FileDiff, Job, JobStatus, PullKey, PullRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pulls (
    repo TEXT NOT NULL,
    number INTEGER NOT NULL,
    head_sha TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    files_json TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (repo, number)
);
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    pull_number INTEGER NOT NULL,
    repo TEXT NOT NULL,
    status TEXT NOT NULL,
    head_sha TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT '1970-01-01T00:00:00+00:00'
);
CREATE INDEX IF NOT EXISTS jobs_pull ON jobs (repo, pull_number);
CREATE INDEX IF NOT EXISTS jobs_status ON jobs (status);
";

/// SQLite-backed store. One connection behind a mutex serializes writes.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Self::migrate(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::migrate(Connection::open_in_memory()?)
    }

    fn migrate(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        let columns = {
            let mut stmt = conn.prepare("PRAGMA table_info(jobs)")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<Vec<_>, _>>()?;
            names
        };
        // Databases created before jobs carried a creation time.
        if !columns.iter().any(|name| name == "created_at") {
            conn.execute(
                "ALTER TABLE jobs ADD COLUMN created_at TEXT NOT NULL
                 DEFAULT '1970-01-01T00:00:00+00:00'",
                [],
            )?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn to_rfc3339(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn from_rfc3339(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt(format!("invalid timestamp '{value}'")))
}

fn load_files(tx: &Transaction<'_>, key: &PullKey) -> Result<Option<Vec<FileDiff>>, StoreError> {
    let json: Option<String> = tx
        .query_row(
            "SELECT files_json FROM pulls WHERE repo = ?1 AND number = ?2",
            params![key.repo, key.number as i64],
            |row| row.get(0),
        )
        .optional()?;
    json.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
        .transpose()
}

fn save_files(tx: &Transaction<'_>, key: &PullKey, files: &[FileDiff]) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE pulls SET files_json = ?3 WHERE repo = ?1 AND number = ?2",
        params![key.repo, key.number as i64, serde_json::to_string(files)?],
    )?;
    Ok(())
}

fn load_jobs(conn: &Connection, key: &PullKey) -> Result<Vec<Job>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, pull_number, status, head_sha, created_at FROM jobs
         WHERE repo = ?1 AND pull_number = ?2 ORDER BY rowid ASC",
    )?;
    let rows = stmt.query_map(params![key.repo, key.number as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut jobs = Vec::new();
    for row in rows {
        let (id, pull_number, status, head_sha, created_at) = row?;
        jobs.push(Job {
            id,
            pull_number: pull_number as u64,
            head_sha,
            status: status.parse().map_err(StoreError::Corrupt)?,
            created_at: from_rfc3339(&created_at)?,
        });
    }
    Ok(jobs)
}

impl PullStore for SqliteStore {
    fn find_pull(&self, key: &PullKey) -> Result<Option<PullRecord>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT head_sha, created_at, updated_at, files_json FROM pulls
                 WHERE repo = ?1 AND number = ?2",
                params![key.repo, key.number as i64],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((head_sha, created_at, updated_at, files_json)) = row else {
            return Ok(None);
        };

        Ok(Some(PullRecord {
            repo: key.repo.clone(),
            number: key.number,
            head_sha,
            created_at: from_rfc3339(&created_at)?,
            updated_at: from_rfc3339(&updated_at)?,
            files: serde_json::from_str(&files_json)?,
            jobs: load_jobs(&conn, key)?,
        }))
    }

    fn insert_pull(&self, record: &PullRecord) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO pulls (repo, number, head_sha, created_at, updated_at, files_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.repo,
                record.number as i64,
                record.head_sha,
                to_rfc3339(&record.created_at),
                to_rfc3339(&record.updated_at),
                serde_json::to_string(&record.files)?,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn update_files(&self, key: &PullKey, files: &[FileDiff]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let previous = load_files(&tx, key)?.unwrap_or_default();
        let mut files = files.to_vec();
        carry_reported(&previous, &mut files);
        save_files(&tx, key, &files)?;
        tx.commit()?;
        Ok(())
    }

    fn begin_job(&self, key: &PullKey, job: &Job) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outstanding: i64 = tx.query_row(
            "SELECT COUNT(*) FROM jobs WHERE repo = ?1 AND pull_number = ?2
             AND status IN ('new', 'started')",
            params![key.repo, key.number as i64],
            |row| row.get(0),
        )?;
        if outstanding > 0 {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO jobs (id, pull_number, repo, status, head_sha, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id,
                job.pull_number as i64,
                key.repo,
                job.status.as_str(),
                job.head_sha,
                to_rfc3339(&job.created_at)
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn record_build(
        &self,
        key: &PullKey,
        head_sha: &str,
        watermark: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE pulls SET head_sha = ?3, updated_at = ?4 WHERE repo = ?1 AND number = ?2",
            params![key.repo, key.number as i64, head_sha, to_rfc3339(&watermark)],
        )?;
        Ok(())
    }

    fn forget_build(&self, key: &PullKey, head_sha: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE pulls SET head_sha = NULL WHERE repo = ?1 AND number = ?2 AND head_sha = ?3",
            params![key.repo, key.number as i64, head_sha],
        )?;
        Ok(changed == 1)
    }

    fn transition_job(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3 WHERE id = ?1 AND status = ?2",
            params![job_id, from.as_str(), to.as_str()],
        )?;
        Ok(changed == 1)
    }

    fn pulls_with_outstanding_jobs(&self) -> Result<Vec<PullRecord>, StoreError> {
        let keys = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT DISTINCT repo, pull_number FROM jobs WHERE status IN ('new', 'started')
                 ORDER BY repo, pull_number",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(PullKey::new(row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            let keys = rows.collect::<Result<Vec<_>, _>>()?;
            keys
        };

        let mut pulls = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.find_pull(&key)? {
                pulls.push(record);
            }
        }
        Ok(pulls)
    }

    fn mark_reported(&self, key: &PullKey, filename: &str, line: u64) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut files) = load_files(&tx, key)? else {
            return Ok(false);
        };
        let inserted = match files.iter_mut().find(|f| f.filename == filename) {
            Some(file) => file.reported.insert(line),
            None => false,
        };
        if inserted {
            save_files(&tx, key, &files)?;
            tx.commit()?;
        }
        Ok(inserted)
    }
}
