//! libSQL backend: async `JobStore` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as fixed-width RFC 3339 (microseconds, `Z` suffix) so that SQL string
//! comparison agrees with chronological order.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock, clamp_timestamp, sub_duration};
use crate::error::DatabaseError;
use crate::queue::{
    DEFAULT_MAX_ATTEMPTS, EventType, Job, JobEvent, JobStatus, NewJob, NewJobEvent,
    PRIORITY_NORMAL, QueueStats,
};
use crate::store::migrations;
use crate::store::traits::JobStore;

/// Rows per multi-row event insert.
const EVENT_INSERT_CHUNK: usize = 100;

/// Error text stored on jobs released by [`JobStore::reclaim_stale`].
pub const LEASE_EXPIRED_ERROR: &str = "processing lease expired";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    clock: Arc<dyn Clock>,
    default_max_attempts: u32,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self::from_parts(db, conn);
        backend
            .apply_pragmas(&[
                "PRAGMA foreign_keys = ON",
                "PRAGMA journal_mode = WAL",
                "PRAGMA synchronous = NORMAL",
                "PRAGMA busy_timeout = 5000",
            ])
            .await?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self::from_parts(db, conn);
        backend.apply_pragmas(&["PRAGMA foreign_keys = ON"]).await?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_parts(db: LibSqlDatabase, conn: Connection) -> Self {
        Self {
            db: Arc::new(db),
            conn,
            clock: Arc::new(SystemClock),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Use a different time source for schedule checks and timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attempts given to jobs enqueued without an explicit `max_attempts`.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Get the connection.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn apply_pragmas(&self, pragmas: &[&str]) -> Result<(), DatabaseError> {
        for pragma in pragmas {
            // Some pragmas answer with a row, so go through `query`.
            let mut rows = self
                .conn()
                .query(pragma, ())
                .await
                .map_err(|e| DatabaseError::Pool(format!("Failed to execute {pragma:?}: {e}")))?;
            while let Ok(Some(_)) = rows.next().await {}
        }
        Ok(())
    }

    /// Turn a zero-row update into the right error.
    async fn check_affected(
        &self,
        affected: u64,
        id: Uuid,
        op: &str,
    ) -> Result<(), DatabaseError> {
        if affected > 0 {
            return Ok(());
        }
        match self.get_status(id).await? {
            None => Err(DatabaseError::NotFound {
                entity: "job".into(),
                id: id.to_string(),
            }),
            Some(job) => Err(DatabaseError::Constraint(format!(
                "{op}: job {id} is already {}",
                job.status
            ))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp encoding, clamped to four-digit years.
fn ts(dt: DateTime<Utc>) -> String {
    clamp_timestamp(dt).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

const JOB_COLUMNS: &str = "id, template_slug, recipients, subject, data, status, priority, attempts, max_attempts, scheduled_at, sent_at, delivery_ref, last_error, created_at, updated_at";

/// Map a libsql Row to a Job. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("job row parse: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let recipients_str: String = row.get(2).map_err(get_err)?;
    let data_str: Option<String> = row.get(4).ok();
    let status_str: String = row.get(5).map_err(get_err)?;
    let priority: i64 = row.get(6).map_err(get_err)?;
    let attempts: i64 = row.get(7).map_err(get_err)?;
    let max_attempts: i64 = row.get(8).map_err(get_err)?;
    let scheduled_str: Option<String> = row.get(9).ok();
    let sent_str: Option<String> = row.get(10).ok();
    let created_str: String = row.get(13).map_err(get_err)?;
    let updated_str: String = row.get(14).map_err(get_err)?;

    let recipients: Vec<String> = serde_json::from_str(&recipients_str)
        .map_err(|e| DatabaseError::Serialization(format!("recipients for job {id_str}: {e}")))?;
    let template_data: Map<String, Value> = match data_str.as_deref() {
        Some(s) if !s.is_empty() => serde_json::from_str(s)
            .map_err(|e| DatabaseError::Serialization(format!("data for job {id_str}: {e}")))?,
        _ => Map::new(),
    };

    Ok(Job {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("job id {id_str}: {e}")))?,
        template_slug: row.get(1).map_err(get_err)?,
        recipients,
        subject: row.get(3).map_err(get_err)?,
        template_data,
        status: status_str
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(e))?,
        priority: priority as i32,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        scheduled_at: parse_optional_datetime(&scheduled_str),
        sent_at: parse_optional_datetime(&sent_str),
        delivery_ref: row.get(11).ok(),
        last_error: row.get(12).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_event(row: &libsql::Row) -> Result<JobEvent, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("event row parse: {e}"));

    let job_id: String = row.get(1).map_err(get_err)?;
    let event_type: String = row.get(2).map_err(get_err)?;
    let timestamp: String = row.get(3).map_err(get_err)?;

    Ok(JobEvent {
        id: row.get(0).map_err(get_err)?,
        job_id: Uuid::parse_str(&job_id)
            .map_err(|e| DatabaseError::Serialization(format!("event job id {job_id}: {e}")))?,
        event_type: event_type
            .parse::<EventType>()
            .map_err(DatabaseError::Serialization)?,
        timestamp: parse_datetime(&timestamp),
        details: row.get::<String>(4).unwrap_or_default(),
    })
}

async fn collect_jobs(mut rows: libsql::Rows, op: &str) -> Result<Vec<Job>, DatabaseError> {
    let mut jobs = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        match row_to_job(&row) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!(error = %e, "Skipping job row"),
        }
    }
    Ok(jobs)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn enqueue(&self, job: NewJob) -> Result<Uuid, DatabaseError> {
        if job.recipients.is_empty() {
            return Err(DatabaseError::Constraint(
                "job must have at least one recipient".into(),
            ));
        }

        let id = job.id.unwrap_or_else(Uuid::new_v4);
        let max_attempts = job
            .max_attempts
            .filter(|n| *n > 0)
            .unwrap_or(self.default_max_attempts);
        let priority = job.priority.unwrap_or(PRIORITY_NORMAL);
        let now = ts(self.now());

        let recipients = serde_json::to_string(&job.recipients)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let data = if job.template_data.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&job.template_data)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            )
        };

        self.conn()
            .execute(
                "INSERT INTO jobs (id, template_slug, recipients, subject, data, status, priority, attempts, max_attempts, scheduled_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, 0, ?7, ?8, ?9, ?9)",
                params![
                    id.to_string(),
                    job.template_slug.as_str(),
                    recipients,
                    job.subject.as_str(),
                    opt_text(data.as_deref()),
                    priority as i64,
                    max_attempts as i64,
                    opt_text(job.scheduled_at.map(ts).as_deref()),
                    now,
                ],
            )
            .await
            .map_err(query_err("enqueue"))?;

        debug!(job_id = %id, template = %job.template_slug, priority, "Job enqueued");
        Ok(id)
    }

    async fn get_status(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_status"))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_status: {e}"))),
        }
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        let limit = limit as i64;
        let rows = match status {
            Some(status) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                        ),
                        params![status.as_str(), limit],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                        ),
                        params![limit],
                    )
                    .await
            }
        }
        .map_err(query_err("list"))?;

        collect_jobs(rows, "list").await
    }

    async fn stats(&self) -> Result<QueueStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM jobs GROUP BY status", ())
            .await
            .map_err(query_err("stats"))?;

        let mut stats = QueueStats::default();
        while let Some(row) = rows.next().await.map_err(query_err("stats"))? {
            let status: String = row.get(0).map_err(query_err("stats"))?;
            let count: i64 = row.get(1).map_err(query_err("stats"))?;
            match status.parse::<JobStatus>() {
                Ok(status) => stats.set(status, count.max(0) as u64),
                Err(e) => warn!(error = %e, "Ignoring unknown status in stats"),
            }
        }
        Ok(stats)
    }

    async fn claim_next(&self) -> Result<Option<Job>, DatabaseError> {
        // Select and transition in one statement so no two callers can take
        // the same row.
        let now = ts(self.now());
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE jobs SET status = 'processing', updated_at = ?1
                     WHERE id = (
                         SELECT id FROM jobs
                         WHERE status IN ('pending', 'retry')
                           AND (scheduled_at IS NULL OR scheduled_at <= ?1)
                         ORDER BY priority DESC, created_at ASC, rowid ASC
                         LIMIT 1
                     )
                     AND status IN ('pending', 'retry')
                     RETURNING {JOB_COLUMNS}"
                ),
                params![now],
            )
            .await
            .map_err(query_err("claim_next"))?;

        let claimed = match rows.next().await.map_err(query_err("claim_next"))? {
            Some(row) => Some(row_to_job(&row)?),
            None => None,
        };
        while let Ok(Some(_)) = rows.next().await {}

        if let Some(ref job) = claimed {
            debug!(job_id = %job.id, priority = job.priority, attempts = job.attempts, "Job claimed");
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, id: Uuid, delivery_ref: &str) -> Result<(), DatabaseError> {
        let now = ts(self.now());
        let delivery_ref = (!delivery_ref.is_empty()).then_some(delivery_ref);
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'sent', sent_at = ?1, delivery_ref = ?2, last_error = NULL, attempts = attempts + 1, updated_at = ?1 WHERE id = ?3",
                params![now, opt_text(delivery_ref), id.to_string()],
            )
            .await
            .map_err(query_err("mark_sent"))?;
        self.check_affected(affected, id, "mark_sent").await?;

        debug!(job_id = %id, "Job marked sent");
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let now = ts(self.now());
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'retry', last_error = ?1, attempts = attempts + 1, scheduled_at = ?2, updated_at = ?3
                 WHERE id = ?4 AND status NOT IN ('sent', 'failed')",
                params![error, ts(retry_at), now, id.to_string()],
            )
            .await
            .map_err(query_err("mark_retry"))?;
        self.check_affected(affected, id, "mark_retry").await?;

        debug!(job_id = %id, retry_at = %retry_at, "Job scheduled for retry");
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        let now = ts(self.now());
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'failed', last_error = ?1, attempts = attempts + 1, updated_at = ?2 WHERE id = ?3",
                params![error, now, id.to_string()],
            )
            .await
            .map_err(query_err("mark_failed"))?;
        self.check_affected(affected, id, "mark_failed").await?;

        debug!(job_id = %id, "Job marked failed");
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = ts(self.now());
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?1, last_error = COALESCE(?2, last_error), attempts = attempts + 1, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), opt_text(error), now, id.to_string()],
            )
            .await
            .map_err(query_err("update_status"))?;
        self.check_affected(affected, id, "update_status").await?;

        debug!(job_id = %id, status = %status, "Job status updated");
        Ok(())
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize, DatabaseError> {
        let now = self.now();
        let cutoff = ts(sub_duration(now, older_than));
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET
                     status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'retry' END,
                     attempts = attempts + 1,
                     scheduled_at = NULL,
                     last_error = ?1,
                     updated_at = ?2
                 WHERE status = 'processing' AND updated_at < ?3",
                params![LEASE_EXPIRED_ERROR, ts(now), cutoff],
            )
            .await
            .map_err(query_err("reclaim_stale"))?;

        if affected > 0 {
            info!(count = affected, "Reclaimed jobs with expired processing lease");
        }
        Ok(affected as usize)
    }

    async fn insert_events(&self, events: &[NewJobEvent]) -> Result<(), DatabaseError> {
        for chunk in events.chunks(EVENT_INSERT_CHUNK) {
            let placeholders = (0..chunk.len())
                .map(|i| {
                    let base = i * 4;
                    format!("(?{}, ?{}, ?{}, ?{})", base + 1, base + 2, base + 3, base + 4)
                })
                .collect::<Vec<_>>()
                .join(", ");

            let mut values: Vec<libsql::Value> = Vec::with_capacity(chunk.len() * 4);
            for event in chunk {
                values.push(libsql::Value::Text(event.job_id.to_string()));
                values.push(libsql::Value::Text(event.event_type.as_str().to_string()));
                values.push(libsql::Value::Text(ts(event.timestamp)));
                values.push(libsql::Value::Text(event.details.clone()));
            }

            self.conn()
                .execute(
                    &format!(
                        "INSERT INTO job_events (job_id, event_type, timestamp, details) VALUES {placeholders}"
                    ),
                    libsql::params::Params::Positional(values),
                )
                .await
                .map_err(query_err("insert_events"))?;
        }
        Ok(())
    }

    async fn list_events(&self, job_id: Uuid) -> Result<Vec<JobEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, job_id, event_type, timestamp, details FROM job_events WHERE job_id = ?1 ORDER BY id ASC",
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("list_events"))?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_events"))? {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }
}
