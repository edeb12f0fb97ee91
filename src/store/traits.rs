//! `JobStore` trait: single async interface for queue persistence.
//!
//! Every mutator is one atomic statement against the store, so workers need
//! no in-process locking to coordinate over job state.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::{Job, JobEvent, JobStatus, NewJob, NewJobEvent, QueueStats};

/// Backend-agnostic durable job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Producer surface ────────────────────────────────────────────

    /// Persist a new job as `pending`, filling in defaults. Returns its id.
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, DatabaseError>;

    /// Enqueue a job that must not be claimed before `at`.
    async fn schedule(&self, mut job: NewJob, at: DateTime<Utc>) -> Result<Uuid, DatabaseError> {
        job.scheduled_at = Some(at);
        self.enqueue(job).await
    }

    /// Look up a job by id.
    async fn get_status(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// List jobs, newest first. `None` lists every status.
    async fn list(&self, status: Option<JobStatus>, limit: usize)
    -> Result<Vec<Job>, DatabaseError>;

    /// Job counts grouped by status.
    async fn stats(&self) -> Result<QueueStats, DatabaseError>;

    // ── Engine surface ──────────────────────────────────────────────

    /// Atomically take the next eligible job and move it to `processing`.
    ///
    /// Eligible means `pending` or `retry` with no schedule or a schedule at or
    /// before now, ordered by priority (highest first) then creation time.
    /// Returns `None` when nothing is eligible.
    async fn claim_next(&self) -> Result<Option<Job>, DatabaseError>;

    /// Record a successful delivery.
    async fn mark_sent(&self, id: Uuid, delivery_ref: &str) -> Result<(), DatabaseError>;

    /// Put a job back in the queue, claimable again at `retry_at`.
    async fn mark_retry(
        &self,
        id: Uuid,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), DatabaseError>;

    /// Fail a job permanently.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Set an arbitrary status, counting it as an attempt.
    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Release jobs stuck in `processing` for longer than `older_than`.
    ///
    /// Each reclaimed job counts as an attempt: it fails if that exhausts its
    /// attempts, otherwise it becomes immediately claimable as `retry`.
    /// Returns the number of jobs released.
    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize, DatabaseError>;

    // ── Audit events ────────────────────────────────────────────────

    /// Append a batch of events.
    async fn insert_events(&self, events: &[NewJobEvent]) -> Result<(), DatabaseError>;

    /// Events for one job, oldest first.
    async fn list_events(&self, job_id: Uuid) -> Result<Vec<JobEvent>, DatabaseError>;
}
