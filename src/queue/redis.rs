use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::Commands;

use super::{
    Job, JobFilter, JobStatus, QueueError, QueueManager, StatusUpdate, format_timestamp,
    parse_timestamp,
};

pub const DEFAULT_PREFIX: &str = "qbt_rules";

const POOL_SIZE: u32 = 10;
const POOL_TIMEOUT: Duration = Duration::from_secs(5);

type Pool = r2d2::Pool<redis::Client>;
type PooledConnection = r2d2::PooledConnection<redis::Client>;

/// Pops ids off the pending list until one still reads `pending`, then marks
/// it processing. Runs server-side so the pop and the claim commit together.
///
/// KEYS: pending list, pending set, processing set.
/// ARGV: job key prefix, pending status, processing status, started_at.
const CLAIM_SCRIPT: &str = r#"
while true do
    local id = redis.call('LPOP', KEYS[1])
    if not id then
        return false
    end
    local job = ARGV[1] .. id
    if redis.call('HGET', job, 'status') == ARGV[2] then
        redis.call('HSET', job, 'status', ARGV[3], 'started_at', ARGV[4])
        redis.call('SREM', KEYS[2], id)
        redis.call('SADD', KEYS[3], id)
        return redis.call('HGETALL', job)
    end
end
"#;

/// Queue stored in Redis. Layout under the key prefix:
///
/// - `queue:pending`: list of pending job ids in FIFO order
/// - `jobs:{id}`: hash holding the job record
/// - `jobs:status:{status}` and `jobs:context:{context}`: index sets
/// - `jobs:by_time`: sorted set of job ids scored by creation time
pub struct RedisQueue {
    prefix: String,
    pool: RwLock<Option<Pool>>,
    claim: redis::Script,
}

impl RedisQueue {
    pub fn connect(url: &str) -> Result<Self, QueueError> {
        Self::connect_with_prefix(url, DEFAULT_PREFIX)
    }

    pub fn connect_with_prefix(url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let pool = r2d2::Pool::builder()
            .max_size(POOL_SIZE)
            .connection_timeout(POOL_TIMEOUT)
            .build(client)?;

        let mut conn = pool.get()?;
        redis::cmd("PING").query::<String>(&mut *conn)?;
        tracing::debug!(%prefix, "connected to redis");

        Ok(Self {
            prefix: prefix.to_string(),
            pool: RwLock::new(Some(pool)),
            claim: redis::Script::new(CLAIM_SCRIPT),
        })
    }

    fn conn(&self) -> Result<PooledConnection, QueueError> {
        let pool = self
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(QueueError::Closed)?;
        Ok(pool.get()?)
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.prefix)
    }

    fn pending_key(&self) -> String {
        self.key("queue:pending")
    }

    fn job_key(&self, id: &str) -> String {
        self.key(&format!("jobs:{id}"))
    }

    fn status_key(&self, status: JobStatus) -> String {
        self.key(&format!("jobs:status:{status}"))
    }

    fn context_key(&self, context: &str) -> String {
        self.key(&format!("jobs:context:{context}"))
    }

    fn by_time_key(&self) -> String {
        self.key("jobs:by_time")
    }

    fn load_jobs(&self, conn: &mut redis::Connection, ids: &[String]) -> Result<Vec<Job>, QueueError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in ids {
            pipe.hgetall(self.job_key(id));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query(conn)?;

        hashes
            .into_iter()
            .filter(|fields| !fields.is_empty())
            .map(job_from_hash)
            .collect()
    }

    /// Ids matching the filter's index sets, newest first.
    fn filtered_ids(
        &self,
        conn: &mut redis::Connection,
        filter: &JobFilter,
    ) -> Result<Vec<String>, QueueError> {
        let mut sets = Vec::new();
        if let Some(status) = filter.status {
            sets.push(self.status_key(status));
        }
        if let Some(context) = &filter.context {
            sets.push(self.context_key(context));
        }

        let ids: Vec<String> = conn.sinter(&sets)?;
        if ids.is_empty() {
            return Ok(ids);
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.zscore(self.by_time_key(), id);
        }
        let scores: Vec<Option<f64>> = pipe.query(conn)?;

        let mut scored: Vec<(f64, String)> = ids
            .into_iter()
            .zip(scores)
            .filter_map(|(id, score)| score.map(|score| (score, id)))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(scored.into_iter().map(|(_, id)| id).collect())
    }
}

fn score(ts: &DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

fn optional_field(fields: &mut HashMap<String, String>, name: &str) -> Option<String> {
    fields.remove(name).filter(|value| !value.is_empty())
}

/// Rebuilds a job from its `HGETALL` reply. Missing and empty fields read as
/// absent.
pub(crate) fn job_from_hash(mut fields: HashMap<String, String>) -> Result<Job, QueueError> {
    let id = optional_field(&mut fields, "job_id").ok_or_else(|| QueueError::Corrupt {
        id: String::new(),
        reason: "missing job_id".into(),
    })?;

    let status = optional_field(&mut fields, "status")
        .and_then(|status| status.parse().ok())
        .ok_or_else(|| QueueError::Corrupt {
            id: id.clone(),
            reason: "missing or unknown status".into(),
        })?;
    let created_at = optional_field(&mut fields, "created_at").ok_or_else(|| QueueError::Corrupt {
        id: id.clone(),
        reason: "missing created_at".into(),
    })?;
    let created_at = parse_timestamp(&id, &created_at)?;
    let started_at = optional_field(&mut fields, "started_at")
        .map(|ts| parse_timestamp(&id, &ts))
        .transpose()?;
    let completed_at = optional_field(&mut fields, "completed_at")
        .map(|ts| parse_timestamp(&id, &ts))
        .transpose()?;
    let result = optional_field(&mut fields, "result")
        .map(|result| serde_json::from_str(&result))
        .transpose()?;

    Ok(Job {
        context: optional_field(&mut fields, "context"),
        hash_filter: optional_field(&mut fields, "hash_filter"),
        error: optional_field(&mut fields, "error"),
        id,
        status,
        created_at,
        started_at,
        completed_at,
        result,
    })
}

enum Transition {
    Missing,
    Corrupt(String),
    Rejected(JobStatus),
    Applied(JobStatus),
}

impl QueueManager for RedisQueue {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    fn enqueue(
        &self,
        context: Option<&str>,
        hash_filter: Option<&str>,
    ) -> Result<String, QueueError> {
        let id = crate::id::new_id();
        let now = Utc::now();
        let job_key = self.job_key(&id);

        let mut fields = vec![
            ("job_id", id.clone()),
            ("status", JobStatus::Pending.to_string()),
            ("created_at", format_timestamp(&now)),
        ];
        if let Some(context) = context {
            fields.push(("context", context.to_string()));
        }
        if let Some(hash_filter) = hash_filter {
            fields.push(("hash_filter", hash_filter.to_string()));
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&job_key, &fields)
            .ignore()
            .sadd(self.status_key(JobStatus::Pending), &id)
            .ignore()
            .zadd(self.by_time_key(), &id, score(&now))
            .ignore()
            .rpush(self.pending_key(), &id)
            .ignore();
        if let Some(context) = context {
            pipe.sadd(self.context_key(context), &id).ignore();
        }

        let mut conn = self.conn()?;
        pipe.query::<()>(&mut *conn)?;

        tracing::debug!(job_id = %id, "enqueued job");
        Ok(id)
    }

    fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        let started_at = format_timestamp(&Utc::now());
        let mut conn = self.conn()?;

        let claimed: Option<HashMap<String, String>> = self
            .claim
            .key(self.pending_key())
            .key(self.status_key(JobStatus::Pending))
            .key(self.status_key(JobStatus::Processing))
            .arg(self.key("jobs:"))
            .arg(JobStatus::Pending.as_str())
            .arg(JobStatus::Processing.as_str())
            .arg(&started_at)
            .invoke(&mut *conn)?;

        let Some(fields) = claimed else {
            return Ok(None);
        };
        let job = job_from_hash(fields)?;
        tracing::debug!(job_id = %job.id, "claimed job");
        Ok(Some(job))
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn()?;
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(id))?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_hash(fields).map(Some)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        let limit = filter.effective_limit() as usize;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let offset = filter.offset as usize;

        let mut conn = self.conn()?;
        let ids: Vec<String> = if filter.status.is_none() && filter.context.is_none() {
            conn.zrevrange(
                self.by_time_key(),
                offset as isize,
                (offset + limit - 1) as isize,
            )?
        } else {
            self.filtered_ids(&mut conn, filter)?
                .into_iter()
                .skip(offset)
                .take(limit)
                .collect()
        };

        self.load_jobs(&mut conn, &ids)
    }

    fn count_jobs(&self, status: Option<JobStatus>) -> Result<u64, QueueError> {
        let mut conn = self.conn()?;
        let count: u64 = match status {
            Some(status) => conn.scard(self.status_key(status))?,
            None => conn.zcard(self.by_time_key())?,
        };
        Ok(count)
    }

    fn update_status(&self, id: &str, update: &StatusUpdate) -> Result<bool, QueueError> {
        let mut fields = vec![("status", update.status.to_string())];
        if let Some(started_at) = &update.started_at {
            fields.push(("started_at", format_timestamp(started_at)));
        }
        if let Some(completed_at) = &update.completed_at {
            fields.push(("completed_at", format_timestamp(completed_at)));
        }
        if let Some(result) = &update.result {
            fields.push(("result", serde_json::to_string(result)?));
        }
        if let Some(error) = &update.error {
            fields.push(("error", error.clone()));
        }

        let job_key = self.job_key(id);
        let mut conn = self.conn()?;
        let transition = redis::transaction(&mut *conn, &[&job_key], |conn, pipe| {
            let current: Option<String> = conn.hget(&job_key, "status")?;
            let Some(current) = current else {
                return Ok(Some(Transition::Missing));
            };
            let Ok(current) = current.parse::<JobStatus>() else {
                return Ok(Some(Transition::Corrupt(current)));
            };
            if current.is_terminal() {
                return Ok(Some(Transition::Rejected(current)));
            }

            pipe.hset_multiple(&job_key, &fields)
                .ignore()
                .srem(self.status_key(current), id)
                .ignore()
                .sadd(self.status_key(update.status), id)
                .ignore();
            if update.status != JobStatus::Pending {
                pipe.lrem(self.pending_key(), 0, id).ignore();
            }
            let reply: Option<()> = pipe.query(conn)?;
            Ok(reply.map(|()| Transition::Applied(current)))
        })?;

        match transition {
            Transition::Missing => Ok(false),
            Transition::Corrupt(status) => Err(QueueError::Corrupt {
                id: id.to_string(),
                reason: format!("unknown status {status:?}"),
            }),
            Transition::Rejected(status) => Err(QueueError::InvalidTransition {
                id: id.to_string(),
                status,
            }),
            Transition::Applied(from) => {
                tracing::debug!(job_id = %id, %from, to = %update.status, "updated job status");
                Ok(true)
            }
        }
    }

    fn cancel_job(&self, id: &str) -> Result<bool, QueueError> {
        let job_key = self.job_key(id);
        let mut conn = self.conn()?;

        let cancelled = redis::transaction(&mut *conn, &[&job_key], |conn, pipe| {
            let status: Option<String> = conn.hget(&job_key, "status")?;
            if status.as_deref() != Some(JobStatus::Pending.as_str()) {
                return Ok(Some(false));
            }

            let reply: Option<()> = pipe
                .hset(&job_key, "status", JobStatus::Cancelled.as_str())
                .ignore()
                .srem(self.status_key(JobStatus::Pending), id)
                .ignore()
                .sadd(self.status_key(JobStatus::Cancelled), id)
                .ignore()
                .lrem(self.pending_key(), 0, id)
                .ignore()
                .query(conn)?;
            Ok(reply.map(|()| true))
        })?;

        if cancelled {
            tracing::debug!(job_id = %id, "cancelled job");
        }
        Ok(cancelled)
    }

    fn cleanup_old_jobs(&self, retention: Duration) -> Result<u64, QueueError> {
        let Some(cutoff) = chrono::TimeDelta::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Ok(0);
        };

        let mut conn = self.conn()?;
        let candidates: Vec<String> =
            conn.zrangebyscore(self.by_time_key(), "-inf", score(&cutoff))?;

        let mut deleted = 0;
        for id in candidates {
            let fields: HashMap<String, String> = conn.hgetall(self.job_key(&id))?;
            if fields.is_empty() {
                conn.zrem::<_, _, ()>(self.by_time_key(), &id)?;
                continue;
            }

            let job = match job_from_hash(fields) {
                Ok(job) => job,
                Err(err) => {
                    tracing::warn!(job_id = %id, error = %err, "skipping unreadable job");
                    continue;
                }
            };
            if !job.status.is_terminal() || job.completed_at.unwrap_or(job.created_at) >= cutoff {
                continue;
            }

            let mut pipe = redis::pipe();
            pipe.atomic()
                .del(self.job_key(&id))
                .ignore()
                .zrem(self.by_time_key(), &id)
                .ignore()
                .srem(self.status_key(job.status), &id)
                .ignore()
                .lrem(self.pending_key(), 0, &id)
                .ignore();
            if let Some(context) = &job.context {
                pipe.srem(self.context_key(context), &id).ignore();
            }
            pipe.query::<()>(&mut *conn)?;
            deleted += 1;
        }

        tracing::debug!(deleted, cutoff = %format_timestamp(&cutoff), "cleaned up old jobs");
        Ok(deleted)
    }

    fn get_queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn()?;
        Ok(conn.llen(self.pending_key())?)
    }

    fn average_execution_time(&self) -> Result<Option<f64>, QueueError> {
        let mut conn = self.conn()?;
        let ids: Vec<String> = conn.smembers(self.status_key(JobStatus::Completed))?;
        if ids.is_empty() {
            return Ok(None);
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.cmd("HMGET")
                .arg(self.job_key(id))
                .arg("started_at")
                .arg("completed_at");
        }
        let times: Vec<(Option<String>, Option<String>)> = pipe.query(&mut *conn)?;

        let durations: Vec<f64> = ids
            .iter()
            .zip(times)
            .filter_map(|(id, times)| match times {
                (Some(started), Some(completed)) => {
                    let started = parse_timestamp(id, &started).ok()?;
                    let completed = parse_timestamp(id, &completed).ok()?;
                    Some((completed - started).num_microseconds()? as f64 / 1_000_000.0)
                }
                _ => None,
            })
            .collect();

        if durations.is_empty() {
            return Ok(None);
        }
        Ok(Some(durations.iter().sum::<f64>() / durations.len() as f64))
    }

    fn health_check(&self) -> bool {
        self.conn()
            .and_then(|mut conn| Ok(redis::cmd("PING").query::<String>(&mut *conn)?))
            .is_ok()
    }

    fn close(&self) {
        self.pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::debug!("closed redis pool");
    }
}
