//! The job queue adapter (spec component C4): a durable FIFO with
//! at-least-once delivery, backed by redis. spec.md treats the redis broker
//! itself as an external collaborator and only specifies the operations in
//! §4.2/§6; this crate is the concrete client for those operations.

use chrono::Utc;
use coderunner_util::JobId;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Direction};
use serde::{Deserialize, Serialize};
use slog::{debug, Logger};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const WAITING_KEY: &str = "coderunner:queue:waiting";
const ACTIVE_KEY: &str = "coderunner:queue:active";
fn job_key(id: JobId) -> String {
    format!("coderunner:job:{id}")
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("job `{0}` not found")]
    NotFound(JobId),
}

/// Job lifecycle state, per spec.md §3/§4.4. This adapter never writes anything but these six
/// values, so a parse failure on read indicates a genuine protocol mismatch, not a legitimate
/// `<other>` state.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Stalled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
            JobState::Stalled => "stalled",
        };
        f.write_str(s)
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "waiting" => JobState::Waiting,
            "active" => JobState::Active,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "delayed" => JobState::Delayed,
            "stalled" => JobState::Stalled,
            other => {
                return Err(QueueError::Redis(redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "unrecognized job state",
                    other.to_string(),
                ))))
            }
        })
    }
}

/// A durable, queue-resident job record (spec.md §3).
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub language: String,
    pub code: String,
    pub state: JobState,
    pub output: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
}

impl Job {
    fn from_fields(id: JobId, fields: HashMap<String, String>) -> Result<Self, QueueError> {
        let state = fields
            .get("state")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(JobState::Waiting);
        Ok(Self {
            id,
            language: fields.get("language").cloned().unwrap_or_default(),
            code: fields.get("code").cloned().unwrap_or_default(),
            state,
            output: fields.get("output").cloned(),
            error: fields.get("error").cloned(),
            attempts: fields
                .get("attempts")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }
}

/// The shared, multiplexed connection to the broker (spec.md §5: "The queue broker connection
/// is shared and multiplexes all operations; the broker provides its own concurrency safety").
#[derive(Clone)]
pub struct JobQueue {
    conn: ConnectionManager,
}

impl JobQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    /// Round-trips a ping to the broker, for the `GET /health` check (spec.md §4.6/§6).
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Enqueues a new job and returns its id. Never blocks on execution (spec.md §4.6).
    pub async fn enqueue(&self, language: &str, code: &str) -> Result<JobId, QueueError> {
        let id = coderunner_util::new_job_id();
        let mut conn = self.conn.clone();
        let fields: [(&str, String); 6] = [
            ("language", language.to_string()),
            ("code", code.to_string()),
            ("state", JobState::Waiting.to_string()),
            ("attempts", "0".to_string()),
            ("created_at", Utc::now().timestamp_millis().to_string()),
            ("id", id.to_string()),
        ];
        let () = conn.hset_multiple(job_key(id), &fields).await?;
        let () = conn.lpush(WAITING_KEY, id.to_string()).await?;
        Ok(id)
    }

    /// Fetches a job by id. `None` corresponds to spec.md's `NotFound` outcome.
    pub async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_fields(id, fields)?))
    }

    /// Blocks (up to `timeout`) for the next waiting job, moving it atomically into the active
    /// list and marking it `active`. `None` on timeout — callers loop.
    pub async fn dequeue(&self, timeout: Duration, log: &Logger) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let id_str: Option<String> = conn
            .blmove(
                WAITING_KEY,
                ACTIVE_KEY,
                Direction::Right,
                Direction::Left,
                timeout.as_secs_f64(),
            )
            .await?;
        let Some(id_str) = id_str else {
            return Ok(None);
        };
        let id: JobId = id_str
            .parse()
            .map_err(|_| QueueError::Redis((redis::ErrorKind::TypeError, "malformed job id").into()))?;
        let fields: [(&str, String); 2] = [
            ("state", JobState::Active.to_string()),
            ("leased_at", Utc::now().timestamp_millis().to_string()),
        ];
        let () = conn.hset_multiple(job_key(id), &fields).await?;
        let attempts: u32 = conn.hincr(job_key(id), "attempts", 1).await?;
        debug!(log, "dequeued job"; "job_id" => %id, "attempts" => attempts);
        match self.get(id).await? {
            Some(job) => Ok(Some(job)),
            None => Err(QueueError::NotFound(id)),
        }
    }

    /// Publishes a successful terminal result (spec.md §4.4 step 6).
    pub async fn resolve_completed(&self, id: JobId, stdout: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let fields: [(&str, &str); 2] = [("state", "completed"), ("output", stdout)];
        let () = conn.hset_multiple(job_key(id), &fields).await?;
        let () = conn.lrem(ACTIVE_KEY, 1, id.to_string()).await?;
        Ok(())
    }

    /// Publishes a failure result; artifacts of failed jobs are retained by the caller
    /// (spec.md §4.4 step 7 / §7's propagation policy).
    pub async fn resolve_failed(&self, id: JobId, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let fields: [(&str, &str); 2] = [("state", "failed"), ("error", reason)];
        let () = conn.hset_multiple(job_key(id), &fields).await?;
        let () = conn.lrem(ACTIVE_KEY, 1, id.to_string()).await?;
        Ok(())
    }

    /// Scans the active list for leases older than `lease_ttl` (a worker that died mid-job
    /// never resolves its job, so the lease set at dequeue time goes stale). Matches the
    /// `active -> stalled -> active` transition of spec.md §4.4: when `redeliver` is false
    /// (the default, per spec.md §9's at-most-once rationale) a stale job is marked `stalled`
    /// and left alone; when true it is moved back onto the waiting list for redelivery.
    /// Returns the number of jobs found stalled.
    pub async fn scan_stalled(&self, lease_ttl: Duration, redeliver: bool) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.lrange(ACTIVE_KEY, 0, -1).await?;
        let now = Utc::now().timestamp_millis();
        let mut stalled = 0;
        for id_str in ids {
            let leased_at: Option<i64> = conn.hget(job_key_str(&id_str), "leased_at").await?;
            let Some(leased_at) = leased_at else { continue };
            if now - leased_at < lease_ttl.as_millis() as i64 {
                continue;
            }
            stalled += 1;
            if redeliver {
                let () = conn.lrem(ACTIVE_KEY, 1, id_str.clone()).await?;
                let () = conn.lpush(WAITING_KEY, id_str.clone()).await?;
                let () = conn
                    .hset(job_key_str(&id_str), "state", JobState::Waiting.to_string())
                    .await?;
            } else {
                let () = conn
                    .hset(job_key_str(&id_str), "state", JobState::Stalled.to_string())
                    .await?;
            }
        }
        Ok(stalled)
    }
}

fn job_key_str(id: &str) -> String {
    format!("coderunner:job:{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_round_trips_through_display_and_from_str() {
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
            JobState::Delayed,
            JobState::Stalled,
        ] {
            let rendered = state.to_string();
            assert_eq!(rendered.parse::<JobState>().unwrap(), state);
        }
    }

    #[test]
    fn job_from_fields_defaults_missing_state_to_waiting() {
        let id = coderunner_util::new_job_id();
        let mut fields = HashMap::new();
        fields.insert("language".to_string(), "python".to_string());
        fields.insert("code".to_string(), "print(1)".to_string());
        let job = Job::from_fields(id, fields).unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts, 0);
    }
}
