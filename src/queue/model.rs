//! Job data model: delivery requests, lifecycle statuses, and audit events.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Marketing, newsletters.
pub const PRIORITY_LOW: i32 = 0;
/// Transactional mail.
pub const PRIORITY_NORMAL: i32 = 1;
/// Password resets, security alerts.
pub const PRIORITY_HIGH: i32 = 2;

/// Default number of delivery attempts before a job fails.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its first claim.
    Pending,
    /// Held by exactly one worker.
    Processing,
    /// Delivered to every recipient.
    Sent,
    /// Waiting for its retry time.
    Retry,
    /// Gave up.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Sent,
        JobStatus::Retry,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Retry => "retry",
            Self::Failed => "failed",
        }
    }

    /// Terminal jobs are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    /// Whether a job in this status may be claimed (subject to its schedule).
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retry)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "retry" => Ok(Self::Retry),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A request to deliver a templated email, as submitted by a producer.
///
/// Fields left as `None` are filled in by the store at enqueue time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub template_slug: String,
    pub recipients: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub template_data: Map<String, Value>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(
        template_slug: impl Into<String>,
        recipients: Vec<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            template_slug: template_slug.into(),
            recipients,
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.template_data = data;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// A persisted delivery job and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub template_slug: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub template_data: Map<String, Value>,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Message id reported by the transport on success.
    pub delivery_ref: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Attempts left before the job fails for good.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// Kind of audited transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Sent,
    Retry,
    Failed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Retry => "retry",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "retry" => Ok(Self::Retry),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// An event waiting to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJobEvent {
    pub job_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub details: String,
}

/// Append-only audit record of a job transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub details: String,
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub retry: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Sent => self.sent,
            JobStatus::Retry => self.retry,
            JobStatus::Failed => self.failed,
        }
    }

    pub fn set(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Sent => &mut self.sent,
            JobStatus::Retry => &mut self.retry,
            JobStatus::Failed => &mut self.failed,
        };
        *slot = count;
    }

    /// Jobs not yet in a terminal state.
    pub fn depth(&self) -> u64 {
        self.pending + self.retry + self.processing
    }

    pub fn total(&self) -> u64 {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}
