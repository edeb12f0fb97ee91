//! Buffered audit trail for job transitions.
//!
//! ```text
//! record(event)
//!     │  try_send (never blocks the worker)
//!     ▼
//! [bounded queue] ──► writer task ──► buffer ──► JobStore::insert_events
//!                          ├─ batch_size reached
//!                          ├─ flush_interval tick
//!                          ├─ flush().await
//!                          └─ channel closed
//! ```
//!
//! Events are best-effort: a full queue or a failed insert is logged and the
//! events are dropped. Job state in the store is the source of truth.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::queue::{EventType, NewJobEvent};
use crate::store::JobStore;

/// Recorder tuning.
#[derive(Debug, Clone)]
pub struct EventRecorderConfig {
    /// Events that may wait in the queue before new ones are dropped.
    pub capacity: usize,
    /// Buffered events that trigger a write.
    pub batch_size: usize,
    /// Longest time an event sits in the buffer.
    pub flush_interval: Duration,
}

impl Default for EventRecorderConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
        }
    }
}

enum Command {
    Record(NewJobEvent),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

struct Inner {
    tx: mpsc::Sender<Command>,
    clock: Arc<dyn Clock>,
}

/// Cheap-to-clone handle to the audit writer.
#[derive(Clone)]
pub struct EventRecorder {
    inner: Option<Arc<Inner>>,
}

impl std::fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecorder")
            .field("enabled", &self.inner.is_some())
            .finish()
    }
}

impl EventRecorder {
    /// Start a writer task on the current runtime.
    pub fn spawn(store: Arc<dyn JobStore>, config: EventRecorderConfig) -> Self {
        Self::spawn_with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn spawn_with_clock(
        store: Arc<dyn JobStore>,
        config: EventRecorderConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        tokio::spawn(run_writer(
            store,
            rx,
            config.batch_size.max(1),
            config.flush_interval.max(Duration::from_millis(1)),
        ));
        Self {
            inner: Some(Arc::new(Inner { tx, clock })),
        }
    }

    /// A recorder that drops every event.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Queue an event without waiting. Returns whether it was accepted.
    pub fn record(&self, job_id: Uuid, event_type: EventType, details: impl Into<String>) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };

        let event = NewJobEvent {
            job_id,
            event_type,
            timestamp: inner.clock.now(),
            details: details.into(),
        };

        match inner.tx.try_send(Command::Record(event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(job_id = %job_id, event = %event_type, "Event buffer full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(job_id = %job_id, event = %event_type, "Event writer closed, dropping event");
                false
            }
        }
    }

    /// Write everything queued so far and wait for it to land.
    pub async fn flush(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if inner.tx.send(Command::Flush(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    /// Flush and stop the writer. Later events are dropped.
    pub async fn close(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if inner.tx.send(Command::Close(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

async fn run_writer(
    store: Arc<dyn JobStore>,
    mut rx: mpsc::Receiver<Command>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buffer: Vec<NewJobEvent> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Record(event)) => {
                    buffer.push(event);
                    if buffer.len() >= batch_size {
                        write_batch(store.as_ref(), &mut buffer).await;
                    }
                }
                Some(Command::Flush(ack)) => {
                    write_batch(store.as_ref(), &mut buffer).await;
                    let _ = ack.send(());
                }
                Some(Command::Close(ack)) => {
                    write_batch(store.as_ref(), &mut buffer).await;
                    rx.close();
                    let _ = ack.send(());
                    break;
                }
                None => {
                    write_batch(store.as_ref(), &mut buffer).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                write_batch(store.as_ref(), &mut buffer).await;
            }
        }
    }

    debug!("Event writer stopped");
}

async fn write_batch(store: &dyn JobStore, buffer: &mut Vec<NewJobEvent>) {
    if buffer.is_empty() {
        return;
    }
    match store.insert_events(buffer).await {
        Ok(()) => debug!(count = buffer.len(), "Wrote job events"),
        Err(e) => error!(count = buffer.len(), error = %e, "Failed to write job events"),
    }
    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::NewJob;
    use crate::store::LibSqlBackend;

    async fn store_with_job() -> (Arc<LibSqlBackend>, Uuid) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let id = store
            .enqueue(NewJob::new("welcome", vec!["a@x.com".into()], "Hi"))
            .await
            .unwrap();
        (store, id)
    }

    async fn wait_for_events(store: &LibSqlBackend, id: Uuid, expected: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let count = store.list_events(id).await.unwrap().len();
            if count >= expected || Instant::now() >= deadline {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn flushes_when_batch_is_full() {
        let (store, id) = store_with_job().await;
        let recorder = EventRecorder::spawn(
            store.clone(),
            EventRecorderConfig {
                batch_size: 3,
                flush_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );

        for i in 0..3 {
            assert!(recorder.record(id, EventType::Retry, format!("attempt {i}")));
        }
        assert_eq!(wait_for_events(&store, id, 3).await, 3);
    }

    #[tokio::test]
    async fn flushes_on_interval() {
        let (store, id) = store_with_job().await;
        let recorder = EventRecorder::spawn(
            store.clone(),
            EventRecorderConfig {
                batch_size: 100,
                flush_interval: Duration::from_millis(50),
                ..Default::default()
            },
        );

        recorder.record(id, EventType::Sent, "");
        assert_eq!(wait_for_events(&store, id, 1).await, 1);
    }

    #[tokio::test]
    async fn explicit_flush_writes_pending_events() {
        let (store, id) = store_with_job().await;
        let recorder = EventRecorder::spawn(
            store.clone(),
            EventRecorderConfig {
                batch_size: 100,
                flush_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );

        recorder.record(id, EventType::Retry, "attempt 1");
        recorder.record(id, EventType::Failed, "550 no such user");
        recorder.flush().await;

        let events = store.list_events(id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Retry);
        assert_eq!(events[1].details, "550 no such user");
    }

    #[tokio::test]
    async fn full_buffer_drops_events() {
        let (store, id) = store_with_job().await;
        let recorder = EventRecorder::spawn(
            store.clone(),
            EventRecorderConfig {
                capacity: 1,
                batch_size: 100,
                flush_interval: Duration::from_secs(3600),
            },
        );

        // The writer cannot run until this task yields.
        assert!(recorder.record(id, EventType::Retry, "kept"));
        assert!(!recorder.record(id, EventType::Retry, "dropped"));

        recorder.flush().await;
        let events = store.list_events(id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].details, "kept");
    }

    #[tokio::test]
    async fn close_stops_accepting_events() {
        let (store, id) = store_with_job().await;
        let recorder = EventRecorder::spawn(store.clone(), EventRecorderConfig::default());

        recorder.record(id, EventType::Sent, "");
        recorder.close().await;
        assert_eq!(store.list_events(id).await.unwrap().len(), 1);
        assert!(!recorder.record(id, EventType::Sent, "late"));
    }

    #[tokio::test]
    async fn disabled_recorder_is_inert() {
        let recorder = EventRecorder::disabled();
        assert!(!recorder.is_enabled());
        assert!(!recorder.record(Uuid::new_v4(), EventType::Sent, ""));
        recorder.flush().await;
        recorder.close().await;
    }
}
