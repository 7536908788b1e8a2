//! Redis-backed job queue (durable, shared by every worker process).
//!
//! ## Layout
//!
//! - `{prefix}:jobs` hash: job id -> job JSON
//! - `{prefix}:queue:{name}` sorted set: job id scored by `not_before` (ms)
//! - `{prefix}:running` sorted set: job id scored by lease deadline (ms)
//! - `{prefix}:dead` hash: job id -> dead-letter entry JSON
//! - `{prefix}:queues` set: every queue name seen
//! - `{prefix}:completed` counter
//!
//! Claiming runs as a Lua script, so one claim moves a job from its queue to
//! the running set atomically and two workers never receive the same job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{instrument, warn};

use super::queue::{JobQueue, QueueError, QueueStats};
use super::types::{DeadLetterEntry, Job, JobId, JobStatus, NewJob, QueueName};

/// Default key prefix
pub const DEFAULT_KEY_PREFIX: &str = "eduapp:jobs";

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[4])
return 1
"#;

// KEYS[1] = running set, KEYS[2..] = queue sets in claim order
// ARGV[1] = now (ms), ARGV[2] = lease deadline (ms)
const CLAIM_SCRIPT: &str = r#"
for i = 2, #KEYS do
  local ids = redis.call('ZRANGEBYSCORE', KEYS[i], '-inf', ARGV[1], 'LIMIT', 0, 1)
  if #ids > 0 then
    redis.call('ZREM', KEYS[i], ids[1])
    redis.call('ZADD', KEYS[1], ARGV[2], ids[1])
    return ids[1]
  end
end
return false
"#;

#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    client: Arc<redis::Client>,
    prefix: String,
}

fn command_error(op: &str, e: redis::RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        QueueError::Unavailable(format!("{op}: {e}"))
    } else {
        QueueError::Storage(format!("{op}: {e}"))
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, QueueError> {
    serde_json::to_string(value).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, QueueError> {
    serde_json::from_str(raw).map_err(|e| QueueError::Serialization(e.to_string()))
}

impl RedisJobQueue {
    /// Create a queue over `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
        })
    }

    fn conn(&self) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    fn jobs_key(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    fn queue_key(&self, queue: &QueueName) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn running_key(&self) -> String {
        format!("{}:running", self.prefix)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.prefix)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn completed_key(&self) -> String {
        format!("{}:completed", self.prefix)
    }

    fn load(&self, conn: &mut redis::Connection, id: JobId) -> Result<Option<Job>, QueueError> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.jobs_key())
            .arg(id.to_string())
            .query(conn)
            .map_err(|e| command_error("HGET", e))?;
        raw.as_deref().map(from_json).transpose()
    }

    fn write_rescheduled(&self, conn: &mut redis::Connection, job: &Job) -> Result<(), QueueError> {
        let id = job.id.to_string();
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.jobs_key())
            .arg(&id)
            .arg(to_json(job)?)
            .ignore()
            .cmd("ZREM")
            .arg(self.running_key())
            .arg(&id)
            .ignore()
            .cmd("ZADD")
            .arg(self.queue_key(&job.queue))
            .arg(job.not_before.timestamp_millis())
            .arg(&id)
            .ignore()
            .query::<()>(conn)
            .map_err(|e| command_error("reschedule", e))
    }

    fn write_dead(
        &self,
        conn: &mut redis::Connection,
        entry: &DeadLetterEntry,
    ) -> Result<(), QueueError> {
        let id = entry.job.id.to_string();
        redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.jobs_key())
            .arg(&id)
            .ignore()
            .cmd("ZREM")
            .arg(self.running_key())
            .arg(&id)
            .ignore()
            .cmd("ZREM")
            .arg(self.queue_key(&entry.job.queue))
            .arg(&id)
            .ignore()
            .cmd("HSET")
            .arg(self.dead_key())
            .arg(&id)
            .arg(to_json(entry)?)
            .ignore()
            .query::<()>(conn)
            .map_err(|e| command_error("dead_letter", e))
    }
}

impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, job), fields(job_id = %job.id, task = %job.task, queue = %job.queue), err)]
    fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        let job = Job::from(job);
        let mut conn = self.conn()?;

        let inserted: i64 = redis::Script::new(ENQUEUE_SCRIPT)
            .key(self.jobs_key())
            .key(self.queue_key(&job.queue))
            .key(self.queues_key())
            .arg(job.id.to_string())
            .arg(to_json(&job)?)
            .arg(job.not_before.timestamp_millis())
            .arg(job.queue.as_str())
            .invoke(&mut conn)
            .map_err(|e| command_error("enqueue", e))?;

        if inserted == 0 {
            return Err(QueueError::AlreadyExists(job.id));
        }
        Ok(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn()?;
        self.load(&mut conn, job_id)
    }

    #[instrument(skip(self), err)]
    fn claim_next(&self, queues: &[QueueName], lease: Duration) -> Result<Option<Job>, QueueError> {
        if queues.is_empty() {
            return Ok(None);
        }
        let mut conn = self.conn()?;
        let now = Utc::now();
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX / 2);

        let script = redis::Script::new(CLAIM_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation.key(self.running_key());
        for queue in queues {
            invocation.key(self.queue_key(queue));
        }
        invocation
            .arg(now.timestamp_millis())
            .arg(now.timestamp_millis().saturating_add(lease_ms));
        let claimed: Option<String> = invocation
            .invoke(&mut conn)
            .map_err(|e| command_error("claim", e))?;

        let Some(raw_id) = claimed else {
            return Ok(None);
        };
        let id: JobId = raw_id
            .parse()
            .map_err(|e: uuid::Error| QueueError::Serialization(e.to_string()))?;

        let Some(mut job) = self.load(&mut conn, id)? else {
            // claimed an id without a record; drop the orphan
            warn!(job_id = %id, "claimed job has no record");
            let _: () = redis::cmd("ZREM")
                .arg(self.running_key())
                .arg(&raw_id)
                .query(&mut conn)
                .map_err(|e| command_error("ZREM", e))?;
            return Ok(None);
        };

        job.mark_running(lease);
        let _: () = redis::cmd("HSET")
            .arg(self.jobs_key())
            .arg(&raw_id)
            .arg(to_json(&job)?)
            .query(&mut conn)
            .map_err(|e| command_error("HSET", e))?;

        Ok(Some(job))
    }

    fn complete(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let id = job.id.to_string();
        redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.jobs_key())
            .arg(&id)
            .ignore()
            .cmd("ZREM")
            .arg(self.running_key())
            .arg(&id)
            .ignore()
            .cmd("INCR")
            .arg(self.completed_key())
            .ignore()
            .query::<()>(&mut conn)
            .map_err(|e| command_error("complete", e))
    }

    fn reschedule(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        self.write_rescheduled(&mut conn, job)
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), QueueError> {
        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            job.status = JobStatus::DeadLettered {
                error: reason.clone(),
                attempts: job.attempt,
            };
        }
        job.lease_until = None;
        job.updated_at = Utc::now();

        let mut conn = self.conn()?;
        self.write_dead(&mut conn, &DeadLetterEntry::new(job, reason))
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let mut conn = self.conn()?;
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(self.dead_key())
            .query(&mut conn)
            .map_err(|e| command_error("HVALS", e))?;

        let mut entries = raw
            .iter()
            .map(|r| from_json::<DeadLetterEntry>(r))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| (e.dead_lettered_at, e.job.id));
        entries.truncate(limit);
        Ok(entries)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, QueueError> {
        let mut conn = self.conn()?;
        let id = job_id.to_string();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.dead_key())
            .arg(&id)
            .query(&mut conn)
            .map_err(|e| command_error("HGET", e))?;
        let entry: DeadLetterEntry = from_json(&raw.ok_or(QueueError::NotFound(job_id))?)?;

        let mut job = entry.job;
        job.reset_for_replay();

        redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.dead_key())
            .arg(&id)
            .ignore()
            .cmd("HSET")
            .arg(self.jobs_key())
            .arg(&id)
            .arg(to_json(&job)?)
            .ignore()
            .cmd("ZADD")
            .arg(self.queue_key(&job.queue))
            .arg(job.not_before.timestamp_millis())
            .arg(&id)
            .ignore()
            .cmd("SADD")
            .arg(self.queues_key())
            .arg(job.queue.as_str())
            .ignore()
            .query::<()>(&mut conn)
            .map_err(|e| command_error("retry_dead_letter", e))?;

        Ok(job)
    }

    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let removed: i64 = redis::cmd("HDEL")
            .arg(self.dead_key())
            .arg(job_id.to_string())
            .query(&mut conn)
            .map_err(|e| command_error("HDEL", e))?;
        if removed == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    fn reap_expired_leases(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn()?;
        let now = Utc::now();
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.running_key())
            .arg("-inf")
            .arg(now.timestamp_millis())
            .query(&mut conn)
            .map_err(|e| command_error("ZRANGEBYSCORE", e))?;

        let mut recovered = 0;
        for raw_id in expired {
            let Ok(id) = raw_id.parse::<JobId>() else {
                continue;
            };
            let Some(mut job) = self.load(&mut conn, id)? else {
                continue;
            };
            let started = job.updated_at;
            job.mark_failed("lease expired".to_string(), started, true);
            match &job.status {
                JobStatus::DeadLettered { error, .. } => {
                    let entry = DeadLetterEntry::new(job.clone(), error.clone());
                    self.write_dead(&mut conn, &entry)?;
                }
                _ => self.write_rescheduled(&mut conn, &job)?,
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn()?;
        let queues: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.queues_key())
            .query(&mut conn)
            .map_err(|e| command_error("SMEMBERS", e))?;

        let mut stats = QueueStats::default();
        for name in queues {
            let queue = QueueName::new(name.clone());
            let waiting: usize = redis::cmd("ZCARD")
                .arg(self.queue_key(&queue))
                .query(&mut conn)
                .map_err(|e| command_error("ZCARD", e))?;
            stats.pending += waiting;
            stats.by_queue.insert(name, waiting);
        }

        stats.running = redis::cmd("ZCARD")
            .arg(self.running_key())
            .query(&mut conn)
            .map_err(|e| command_error("ZCARD", e))?;
        stats.dead_lettered = redis::cmd("HLEN")
            .arg(self.dead_key())
            .query(&mut conn)
            .map_err(|e| command_error("HLEN", e))?;
        let completed: Option<u64> = redis::cmd("GET")
            .arg(self.completed_key())
            .query(&mut conn)
            .map_err(|e| command_error("GET", e))?;
        stats.completed = completed.unwrap_or(0);

        Ok(stats)
    }
}
