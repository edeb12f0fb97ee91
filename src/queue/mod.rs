//! Queue data model shared by the store and the delivery engine.

pub mod model;

pub use model::{
    DEFAULT_MAX_ATTEMPTS, EventType, Job, JobEvent, JobStatus, NewJob, NewJobEvent,
    PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL, QueueStats,
};
