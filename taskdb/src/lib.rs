//! # Siphon Task Record Store
//!
//! Typed access to the two task tables the file-operations manager writes
//! and the daemon drains. The store owns no policy: it fetches `new` rows
//! in dispatch order, performs single-row status transitions, lists the
//! `queued` population for the cancellation registry, and re-normalizes
//! orphaned rows around daemon restarts.
//!
//! Schema (status is TEXT, timestamps are DATETIME in UTC):
//!
//!  ____________________________________________________________________________
//! | transfer_tasks                                                             |
//! |____________________________________________________________________________|
//! | id | source | destination | status | exit_code | start_time | finish_time  |
//! |____|________|_____________|________|___________|____________|______________|
//!  ____________________________________________
//! | transfer_batches                           |
//! |____________________________________________|
//! | batch_id | source_site | destination_site  |
//! |__________|_____________|___________________|
//!  _____________________________
//! | transfer_task_batch        | id-matching join table
//! |____________________________|
//! | task_id | batch_id         |
//! |_________|__________________|
//!
//! and the same three tables for deletions, with `file` in place of
//! source/destination and `site` in place of the site pair.
//!
//! Every mutation is a single-row UPDATE and therefore atomic at the
//! database level; the daemon never holds a transaction across a worker
//! invocation.

// Imports
// ----------------------------------------------------------------
use std::{
    collections::HashSet,
    fs::File,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, NaiveDateTime};
use rusqlite::{named_params, params, Connection, OpenFlags, OptionalExtension};
use siphon_lib::{LinkKey, NewTask, OpParams, TaskId, TaskKind, TaskStatus};

// Types
// ----------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum TaskDbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type TaskDbResult<T> = Result<T, TaskDbError>;

/// A full task row, mainly consumed by tests and operator tooling.
#[derive(PartialEq, Debug, Clone, Eq)]
pub struct TaskRow {
    pub id: TaskId,
    pub params: OpParams,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    /// Unix seconds; 0 when the column is NULL.
    pub start_time: i64,
    pub finish_time: i64,
}

#[derive(Debug)]
pub struct TaskDb {
    conn: Connection,
}

/// Cloneable handle shared by the scheduler, pools and workers.
#[derive(Debug, Clone)]
pub struct TaskStore {
    db: Arc<Mutex<TaskDb>>,
}

// Implementation
// ----------------------------------------------------------------

impl TaskDb {
    fn open(path: &Path) -> TaskDbResult<Connection> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(conn)
    }

    fn create(path: &Path) -> TaskDbResult<Connection> {
        let _file = File::options()
            .write(true)
            .read(true)
            .create_new(true)
            .open(path)?;

        let conn = Self::open(path)?;
        Self::create_tables(&conn)?;

        Ok(conn)
    }

    /// Open an existing task database at `path`, creating schema and file
    /// when none exists yet. In production the manager owns the schema; the
    /// bootstrap path serves first boots and the test suite.
    pub fn open_or_create(path: &Path) -> TaskDbResult<Self> {
        let conn = if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }?;
        Ok(Self { conn })
    }

    fn create_tables(conn: &Connection) -> TaskDbResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE transfer_tasks(
                id INTEGER PRIMARY KEY,
                source TEXT NOT NULL,
                destination TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new'
                    CHECK(status IN ('new','queued','active','done','failed','cancelled')),
                exit_code INTEGER,
                start_time DATETIME,
                finish_time DATETIME
            );

            CREATE TABLE transfer_batches(
                batch_id INTEGER PRIMARY KEY,
                source_site TEXT NOT NULL,
                destination_site TEXT NOT NULL
            );

            CREATE TABLE transfer_task_batch(
                task_id INTEGER NOT NULL PRIMARY KEY,
                batch_id INTEGER NOT NULL,
                FOREIGN KEY(task_id) REFERENCES transfer_tasks(id),
                FOREIGN KEY(batch_id) REFERENCES transfer_batches(batch_id)
            );

            CREATE TABLE deletion_tasks(
                id INTEGER PRIMARY KEY,
                file TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new'
                    CHECK(status IN ('new','queued','active','done','failed','cancelled')),
                exit_code INTEGER,
                start_time DATETIME,
                finish_time DATETIME
            );

            CREATE TABLE deletion_batches(
                batch_id INTEGER PRIMARY KEY,
                site TEXT NOT NULL
            );

            CREATE TABLE deletion_task_batch(
                task_id INTEGER NOT NULL PRIMARY KEY,
                batch_id INTEGER NOT NULL,
                FOREIGN KEY(task_id) REFERENCES deletion_tasks(id),
                FOREIGN KEY(batch_id) REFERENCES deletion_batches(batch_id)
            );
            "#,
        )?;
        Ok(())
    }
}

impl TaskStore {
    pub fn open_or_create(path: &Path) -> TaskDbResult<Self> {
        let db = TaskDb::open_or_create(path)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// All `new` rows of one kind joined to their batch, ordered by link and
    /// then task id so that rows sharing a link are contiguous.
    pub fn fetch_new(&self, kind: TaskKind) -> TaskDbResult<Vec<NewTask>> {
        let db = self.db.lock().unwrap();
        match kind {
            TaskKind::Transfer => {
                let mut stmt = db.conn.prepare(
                    "SELECT t.id, t.source, t.destination, b.source_site, b.destination_site
                     FROM transfer_tasks t
                     JOIN transfer_task_batch j ON j.task_id = t.id
                     JOIN transfer_batches b ON b.batch_id = j.batch_id
                     WHERE t.status = 'new'
                     ORDER BY b.source_site, b.destination_site, t.id",
                )?;
                let rows = stmt.query_map(params![], |row| {
                    Ok(NewTask {
                        id: row.get(0)?,
                        params: OpParams::Transfer {
                            source: row.get(1)?,
                            destination: row.get(2)?,
                        },
                        link: LinkKey::Transfer {
                            source_site: row.get(3)?,
                            dest_site: row.get(4)?,
                        },
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            }
            TaskKind::Deletion => {
                let mut stmt = db.conn.prepare(
                    "SELECT t.id, t.file, b.site
                     FROM deletion_tasks t
                     JOIN deletion_task_batch j ON j.task_id = t.id
                     JOIN deletion_batches b ON b.batch_id = j.batch_id
                     WHERE t.status = 'new'
                     ORDER BY b.site, t.id",
                )?;
                let rows = stmt.query_map(params![], |row| {
                    Ok(NewTask {
                        id: row.get(0)?,
                        params: OpParams::Deletion { file: row.get(1)? },
                        link: LinkKey::Deletion { site: row.get(2)? },
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            }
        }
    }

    /// Single-row status transition without outcome columns.
    pub fn set_status(&self, kind: TaskKind, id: TaskId, status: TaskStatus) -> TaskDbResult<()> {
        let db = self.db.lock().unwrap();
        let sql = match kind {
            TaskKind::Transfer => "UPDATE transfer_tasks SET status = :status WHERE id = :id",
            TaskKind::Deletion => "UPDATE deletion_tasks SET status = :status WHERE id = :id",
        };
        db.conn.execute(
            sql,
            named_params! { ":status": status.as_str(), ":id": id },
        )?;
        Ok(())
    }

    /// Single-row terminal transition recording exit code and timestamps
    /// (Unix seconds; 0 stores NULL).
    pub fn set_outcome(
        &self,
        kind: TaskKind,
        id: TaskId,
        status: TaskStatus,
        exit_code: i32,
        started_at: i64,
        finished_at: i64,
    ) -> TaskDbResult<()> {
        let db = self.db.lock().unwrap();
        let sql = match kind {
            TaskKind::Transfer => {
                "UPDATE transfer_tasks
                 SET status = :status, exit_code = :exit_code,
                     start_time = :start_time, finish_time = :finish_time
                 WHERE id = :id"
            }
            TaskKind::Deletion => {
                "UPDATE deletion_tasks
                 SET status = :status, exit_code = :exit_code,
                     start_time = :start_time, finish_time = :finish_time
                 WHERE id = :id"
            }
        };
        db.conn.execute(
            sql,
            named_params! {
                ":status": status.as_str(),
                ":exit_code": exit_code,
                ":start_time": secs_to_datetime(started_at),
                ":finish_time": secs_to_datetime(finished_at),
                ":id": id,
            },
        )?;
        Ok(())
    }

    /// Ids of every row of one kind currently in `queued`; the source of
    /// truth the cancellation registry is rebuilt from on each poll.
    pub fn list_queued(&self, kind: TaskKind) -> TaskDbResult<HashSet<TaskId>> {
        let db = self.db.lock().unwrap();
        let sql = match kind {
            TaskKind::Transfer => "SELECT id FROM transfer_tasks WHERE status = 'queued'",
            TaskKind::Deletion => "SELECT id FROM deletion_tasks WHERE status = 'queued'",
        };
        let mut stmt = db.conn.prepare(sql)?;
        let ids = stmt.query_map(params![], |row| row.get::<_, TaskId>(0))?;
        Ok(ids.collect::<Result<HashSet<_>, _>>()?)
    }

    /// Reset every `queued`/`active` row of both kinds back to `new`.
    /// Idempotent; called once at daemon start and once at daemon stop so
    /// rows stranded by a crash are re-dispatched instead of lost.
    pub fn recover_orphans(&self) -> TaskDbResult<usize> {
        let db = self.db.lock().unwrap();
        let mut reset = 0;
        for sql in [
            "UPDATE transfer_tasks SET status = 'new' WHERE status IN ('queued', 'active')",
            "UPDATE deletion_tasks SET status = 'new' WHERE status IN ('queued', 'active')",
        ] {
            reset += db.conn.execute(sql, params![])?;
        }
        if reset > 0 {
            tracing::info!("TaskStore.recover_orphans: reset {reset} rows to new");
        }
        Ok(reset)
    }

    pub fn get_task(&self, kind: TaskKind, id: TaskId) -> TaskDbResult<Option<TaskRow>> {
        let db = self.db.lock().unwrap();
        let sql = match kind {
            TaskKind::Transfer => {
                "SELECT id, source, destination, status, exit_code, start_time, finish_time
                 FROM transfer_tasks WHERE id = :id"
            }
            TaskKind::Deletion => {
                "SELECT id, file, NULL, status, exit_code, start_time, finish_time
                 FROM deletion_tasks WHERE id = :id"
            }
        };
        let row = db
            .conn
            .query_row(sql, named_params! { ":id": id }, |row| {
                let status: String = row.get(3)?;
                let params = match kind {
                    TaskKind::Transfer => OpParams::Transfer {
                        source: row.get(1)?,
                        destination: row.get(2)?,
                    },
                    TaskKind::Deletion => OpParams::Deletion { file: row.get(1)? },
                };
                Ok((
                    TaskRow {
                        id: row.get(0)?,
                        params,
                        status: TaskStatus::New,
                        exit_code: row.get(4)?,
                        start_time: datetime_to_secs(row.get(5)?),
                        finish_time: datetime_to_secs(row.get(6)?),
                    },
                    status,
                ))
            })
            .optional()?;

        match row {
            None => Ok(None),
            Some((mut task, status)) => {
                task.status = status
                    .parse()
                    .map_err(TaskDbError::Corrupt)?;
                Ok(Some(task))
            }
        }
    }

    // Manager-side helpers, used by the test suite and by operators seeding
    // a development database.
    // ----------------------------------------------------------------

    pub fn insert_batch(&self, link: &LinkKey) -> TaskDbResult<i64> {
        let db = self.db.lock().unwrap();
        match link {
            LinkKey::Transfer {
                source_site,
                dest_site,
            } => {
                db.conn.execute(
                    "INSERT INTO transfer_batches(source_site, destination_site)
                     VALUES (:source_site, :destination_site)",
                    named_params! { ":source_site": source_site, ":destination_site": dest_site },
                )?;
            }
            LinkKey::Deletion { site } => {
                db.conn.execute(
                    "INSERT INTO deletion_batches(site) VALUES (:site)",
                    named_params! { ":site": site },
                )?;
            }
        }
        Ok(db.conn.last_insert_rowid())
    }

    pub fn insert_task(&self, params: &OpParams, batch_id: i64) -> TaskDbResult<TaskId> {
        let db = self.db.lock().unwrap();
        let id = match params {
            OpParams::Transfer {
                source,
                destination,
            } => {
                db.conn.execute(
                    "INSERT INTO transfer_tasks(source, destination) VALUES (:source, :destination)",
                    named_params! { ":source": source, ":destination": destination },
                )?;
                let id = db.conn.last_insert_rowid();
                db.conn.execute(
                    "INSERT INTO transfer_task_batch(task_id, batch_id) VALUES (:task_id, :batch_id)",
                    named_params! { ":task_id": id, ":batch_id": batch_id },
                )?;
                id
            }
            OpParams::Deletion { file } => {
                db.conn.execute(
                    "INSERT INTO deletion_tasks(file) VALUES (:file)",
                    named_params! { ":file": file },
                )?;
                let id = db.conn.last_insert_rowid();
                db.conn.execute(
                    "INSERT INTO deletion_task_batch(task_id, batch_id) VALUES (:task_id, :batch_id)",
                    named_params! { ":task_id": id, ":batch_id": batch_id },
                )?;
                id
            }
        };
        Ok(id)
    }
}

// Timestamp conversion
// ----------------------------------------------------------------

fn secs_to_datetime(secs: i64) -> Option<NaiveDateTime> {
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}

fn datetime_to_secs(value: Option<NaiveDateTime>) -> i64 {
    value.map(|dt| dt.and_utc().timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    // Private-function coverage; the public API is exercised in tests/.
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn error_on_missing() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("tasks.sqlite");
        assert!(TaskDb::open(&file).is_err());
    }

    #[test]
    fn ensure_unicity() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("tasks.sqlite");

        let _db = TaskDb::create(&file).unwrap();
        assert!(TaskDb::create(&file).is_err());
    }

    #[test]
    fn timestamp_conversion_round_trip() {
        assert_eq!(secs_to_datetime(0), None);
        assert_eq!(datetime_to_secs(None), 0);

        let secs = 1_700_000_000;
        assert_eq!(datetime_to_secs(secs_to_datetime(secs)), secs);
    }
}
