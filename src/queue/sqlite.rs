use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use super::{
    Job, JobFilter, JobStatus, QueueError, QueueManager, StatusUpdate, format_timestamp,
    migrations, parse_timestamp,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const JOB_COLUMNS: &str =
    "job_id, context, hash_filter, status, created_at, started_at, completed_at, result, error";

type ConnectionMap = Mutex<HashMap<ThreadId, Arc<Mutex<Connection>>>>;

/// File-backed queue. Each OS thread that touches the queue gets its own
/// connection; connections are never shared between threads. A thread's
/// connection is closed when the thread exits.
pub struct SqliteQueue {
    path: PathBuf,
    connections: Arc<ConnectionMap>,
    closed: AtomicBool,
}

/// Removes a thread's connection from its queue when the thread exits.
struct ThreadConnection {
    connections: Weak<ConnectionMap>,
    thread: ThreadId,
}

impl Drop for ThreadConnection {
    fn drop(&mut self) {
        if let Some(connections) = self.connections.upgrade() {
            connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.thread);
        }
    }
}

thread_local! {
    static THREAD_CONNECTIONS: RefCell<Vec<ThreadConnection>> = const { RefCell::new(Vec::new()) };
}

fn register_thread_connection(connections: &Arc<ConnectionMap>) {
    let guard = ThreadConnection {
        connections: Arc::downgrade(connections),
        thread: std::thread::current().id(),
    };
    // Fails only while the thread is already tearing down its locals.
    let _ = THREAD_CONNECTIONS.try_with(|guards| {
        let mut guards = guards.borrow_mut();
        guards.retain(|guard| guard.connections.strong_count() > 0);
        guards.push(guard);
    });
}

impl SqliteQueue {
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = connect(path)?;
        migrations::run(&mut conn)?;
        tracing::debug!(path = %path.display(), "opened sqlite queue");

        let mut connections = HashMap::new();
        connections.insert(std::thread::current().id(), Arc::new(Mutex::new(conn)));
        let connections = Arc::new(Mutex::new(connections));
        register_thread_connection(&connections);

        Ok(Self {
            path: path.to_path_buf(),
            connections,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<Arc<Mutex<Connection>>, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let thread = std::thread::current().id();
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = connections.get(&thread) {
            return Ok(conn.clone());
        }

        let conn = Arc::new(Mutex::new(connect(&self.path)?));
        connections.insert(thread, conn.clone());
        drop(connections);
        register_thread_connection(&self.connections);
        tracing::trace!(?thread, "opened sqlite connection");
        Ok(conn)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let conn = self.connection()?;
        let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut conn)
    }
}

fn connect(path: &Path) -> Result<Connection, QueueError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

struct JobRow {
    id: String,
    context: Option<String>,
    hash_filter: Option<String>,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    result: Option<String>,
    error: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            context: row.get(1)?,
            hash_filter: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
            result: row.get(7)?,
            error: row.get(8)?,
        })
    }

    fn into_job(self) -> Result<Job, QueueError> {
        let status = parse_status(&self.id, &self.status)?;
        let created_at = parse_timestamp(&self.id, &self.created_at)?;
        let started_at = self
            .started_at
            .as_deref()
            .map(|ts| parse_timestamp(&self.id, ts))
            .transpose()?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(|ts| parse_timestamp(&self.id, ts))
            .transpose()?;
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Job {
            id: self.id,
            context: self.context,
            hash_filter: self.hash_filter,
            status,
            created_at,
            started_at,
            completed_at,
            result,
            error: self.error,
        })
    }
}

fn parse_status(id: &str, value: &str) -> Result<JobStatus, QueueError> {
    value.parse().map_err(|_| QueueError::Corrupt {
        id: id.to_string(),
        reason: format!("unknown status {value:?}"),
    })
}

fn fetch_job(conn: &Connection, id: &str) -> Result<Option<Job>, QueueError> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
        rusqlite::params![id],
        JobRow::from_row,
    )
    .optional()?
    .map(JobRow::into_job)
    .transpose()
}

impl QueueManager for SqliteQueue {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn enqueue(
        &self,
        context: Option<&str>,
        hash_filter: Option<&str>,
    ) -> Result<String, QueueError> {
        let id = crate::id::new_id();
        let now = format_timestamp(&Utc::now());

        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO jobs (job_id, context, hash_filter, status, created_at) VALUES (?1, ?2, ?3, 'pending', ?4)",
                rusqlite::params![id, context, hash_filter, now],
            )?;
            let row_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO queue (job_id, priority) VALUES (?1, 0)",
                rusqlite::params![row_id],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        tracing::debug!(job_id = %id, "enqueued job");
        Ok(id)
    }

    fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            loop {
                let next: Option<(i64, i64, String)> = tx
                    .query_row(
                        "SELECT queue.id, jobs.id, jobs.job_id FROM queue
                         JOIN jobs ON jobs.id = queue.job_id
                         ORDER BY queue.priority DESC, queue.id ASC
                         LIMIT 1",
                        [],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;
                let Some((queue_id, row_id, job_id)) = next else {
                    return Ok(None);
                };

                tx.execute(
                    "DELETE FROM queue WHERE id = ?1",
                    rusqlite::params![queue_id],
                )?;
                let claimed = tx.execute(
                    "UPDATE jobs SET status = 'processing', started_at = ?1 WHERE id = ?2 AND status = 'pending'",
                    rusqlite::params![format_timestamp(&Utc::now()), row_id],
                )?;
                if claimed == 0 {
                    tracing::warn!(job_id = %job_id, "dropping stale queue entry");
                    continue;
                }

                let job = fetch_job(&tx, &job_id)?;
                tx.commit()?;
                return Ok(job);
            }
        })
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        self.with_conn(|conn| fetch_job(conn, id))
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        let mut clauses = Vec::new();
        let mut params: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push("status = ?");
            params.push(status.as_str().to_string().into());
        }
        if let Some(context) = &filter.context {
            clauses.push("context = ?");
            params.push(context.clone().into());
        }

        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
        params.push(i64::from(filter.effective_limit()).into());
        params.push(i64::from(filter.offset).into());

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params), JobRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(JobRow::into_job).collect()
        })
    }

    fn count_jobs(&self, status: Option<JobStatus>) -> Result<u64, QueueError> {
        self.with_conn(|conn| {
            let count: i64 = match status {
                Some(status) => conn.query_row(
                    "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                    rusqlite::params![status.as_str()],
                    |row| row.get(0),
                )?,
                None => conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?,
            };
            Ok(count.max(0) as u64)
        })
    }

    fn update_status(&self, id: &str, update: &StatusUpdate) -> Result<bool, QueueError> {
        let result = update
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let started_at = update.started_at.as_ref().map(format_timestamp);
        let completed_at = update.completed_at.as_ref().map(format_timestamp);

        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM jobs WHERE job_id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                return Ok(false);
            };
            let current = parse_status(id, &current)?;
            if current.is_terminal() {
                return Err(QueueError::InvalidTransition {
                    id: id.to_string(),
                    status: current,
                });
            }

            tx.execute(
                "UPDATE jobs SET
                    status = ?1,
                    started_at = COALESCE(?2, started_at),
                    completed_at = COALESCE(?3, completed_at),
                    result = COALESCE(?4, result),
                    error = COALESCE(?5, error)
                 WHERE job_id = ?6",
                rusqlite::params![
                    update.status.as_str(),
                    started_at,
                    completed_at,
                    result,
                    update.error,
                    id
                ],
            )?;
            if update.status != JobStatus::Pending {
                tx.execute(
                    "DELETE FROM queue WHERE job_id = (SELECT id FROM jobs WHERE job_id = ?1)",
                    rusqlite::params![id],
                )?;
            }
            tx.commit()?;

            tracing::debug!(job_id = %id, from = %current, to = %update.status, "updated job status");
            Ok(true)
        })
    }

    fn cancel_job(&self, id: &str) -> Result<bool, QueueError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let cancelled = tx.execute(
                "UPDATE jobs SET status = 'cancelled' WHERE job_id = ?1 AND status = 'pending'",
                rusqlite::params![id],
            )?;
            if cancelled == 0 {
                return Ok(false);
            }
            tx.execute(
                "DELETE FROM queue WHERE job_id = (SELECT id FROM jobs WHERE job_id = ?1)",
                rusqlite::params![id],
            )?;
            tx.commit()?;

            tracing::debug!(job_id = %id, "cancelled job");
            Ok(true)
        })
    }

    fn cleanup_old_jobs(&self, retention: Duration) -> Result<u64, QueueError> {
        let Some(cutoff) = chrono::TimeDelta::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Ok(0);
        };
        let cutoff = format_timestamp(&cutoff);

        let deleted = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM jobs
                 WHERE status IN ('completed', 'failed', 'cancelled')
                   AND COALESCE(completed_at, created_at) < ?1",
                rusqlite::params![cutoff],
            )?)
        })?;

        tracing::debug!(deleted, %cutoff, "cleaned up old jobs");
        Ok(deleted as u64)
    }

    fn get_queue_depth(&self) -> Result<u64, QueueError> {
        self.with_conn(|conn| {
            let depth: i64 = conn.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
            Ok(depth.max(0) as u64)
        })
    }

    fn average_execution_time(&self) -> Result<Option<f64>, QueueError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT AVG((julianday(completed_at) - julianday(started_at)) * 86400.0)
                 FROM jobs
                 WHERE status = 'completed' AND started_at IS NOT NULL AND completed_at IS NOT NULL",
                [],
                |row| row.get::<_, Option<f64>>(0),
            )?)
        })
    }

    fn health_check(&self) -> bool {
        self.with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .is_ok()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = connections.len();
        connections.clear();
        tracing::debug!(connections = count, "closed sqlite queue");
    }
}
