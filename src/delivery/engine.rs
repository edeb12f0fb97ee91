//! Delivery engine: a fixed pool of workers draining the job store.
//!
//! ```text
//! worker N:  claim_next ─► rate limit ─► render ─► send each recipient
//!                │                                      │
//!                │ none: refresh depth gauge,           ├─ ok:   mark_sent
//!                │       sleep idle backoff (≤ 5s)      └─ fail: mark_retry / mark_failed
//!                ▼
//!            next claim
//!
//! reaper:    every reaper_interval ─► reclaim_stale(processing_lease)
//! ```
//!
//! Workers coordinate only through the store's atomic claim. A panic while
//! delivering one job fails that job and leaves the worker running.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, add_duration};
use crate::config::DeliveryConfig;
use crate::delivery::events::EventRecorder;
use crate::delivery::metrics::{
    DELIVERY_DURATION_SECONDS, EMAILS_FAILED_TOTAL, EMAILS_RETRIED_TOTAL, EMAILS_SENT_TOTAL,
    Metrics, QUEUE_DEPTH,
};
use crate::delivery::rate_limiter::RateLimiter;
use crate::delivery::retry::RetryPolicy;
use crate::error::{DeliveryError, RecipientFailure};
use crate::mail::Mailer;
use crate::queue::{EventType, Job, JobStatus};
use crate::render::Renderer;
use crate::store::JobStore;

/// Collaborators the engine drives.
#[derive(Clone)]
pub struct DeliveryDeps {
    pub store: Arc<dyn JobStore>,
    pub renderer: Arc<dyn Renderer>,
    pub mailer: Arc<dyn Mailer>,
    pub events: EventRecorder,
    pub metrics: Arc<dyn Metrics>,
    pub clock: Arc<dyn Clock>,
}

struct Shared {
    deps: DeliveryDeps,
    config: DeliveryConfig,
    policy: RetryPolicy,
    limiter: RateLimiter,
}

struct RunState {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Worker pool that turns queued jobs into sent mail.
pub struct DeliveryEngine {
    shared: Arc<Shared>,
    running: AtomicBool,
    state: Mutex<Option<RunState>>,
}

impl DeliveryEngine {
    pub fn new(deps: DeliveryDeps, config: DeliveryConfig) -> Self {
        let policy = config.retry_policy();
        let limiter = RateLimiter::new(config.rate_limit_per_minute);
        Self {
            shared: Arc::new(Shared {
                deps,
                config,
                policy,
                limiter,
            }),
            running: AtomicBool::new(false),
            state: Mutex::new(None),
        }
    }

    /// Spawn `worker_count` workers (at least one) and the lease reaper.
    ///
    /// Returns `false` without doing anything if the engine is already running.
    pub fn start(&self, worker_count: usize) -> bool {
        let mut state = self.state.lock();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let cancel = CancellationToken::new();
        let worker_count = worker_count.max(1);
        let mut handles = Vec::with_capacity(worker_count + 1);

        for worker_id in 0..worker_count {
            let shared = Arc::clone(&self.shared);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                debug!(worker_id, "Delivery worker starting");
                shared.run_worker(worker_id, cancel).await;
                debug!(worker_id, "Delivery worker stopped");
            }));
        }

        if let Some(lease) = self.shared.config.processing_lease {
            let shared = Arc::clone(&self.shared);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                shared.run_reaper(lease, cancel).await;
            }));
        }

        info!(
            worker_count,
            rate_limit_per_minute = self.shared.limiter.per_minute(),
            "Delivery engine started"
        );
        *state = Some(RunState { cancel, handles });
        true
    }

    /// Cancel workers, wait for in-flight jobs, then flush audit events.
    ///
    /// No-op when the engine is not running. The engine reports running, and
    /// refuses [`start`](Self::start), until the old workers have exited.
    pub async fn stop(&self) {
        let Some(run) = self.state.lock().take() else {
            return;
        };

        info!("Delivery engine stopping");
        run.cancel.cancel();
        for handle in run.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Delivery task ended abnormally");
            }
        }
        self.running.store(false, Ordering::Release);

        self.shared.deps.events.flush().await;
        info!("Delivery engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Render and send immediately, bypassing the queue.
    ///
    /// Still honours the rate limit. Nothing is persisted and nothing is
    /// retried. Returns the joined delivery references.
    pub async fn send_now(
        &self,
        template_slug: &str,
        recipients: &[String],
        subject: &str,
        data: &Map<String, Value>,
    ) -> Result<String, DeliveryError> {
        let cancel = self
            .state
            .lock()
            .as_ref()
            .map(|run| run.cancel.clone())
            .unwrap_or_else(CancellationToken::new);

        self.shared.limiter.wait(&cancel).await?;
        let html = self.shared.deps.renderer.render(template_slug, data)?;
        self.shared.send_all(recipients, subject, &html).await
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        if let Some(run) = self.state.get_mut().take() {
            run.cancel.cancel();
        }
    }
}

impl Shared {
    async fn run_worker(&self, worker_id: usize, cancel: CancellationToken) {
        let min_idle = self.config.idle_backoff_min;
        let max_idle = self.config.idle_backoff_max.max(min_idle);
        let mut idle = min_idle;

        while !cancel.is_cancelled() {
            match self.deps.store.claim_next().await {
                Ok(Some(job)) => {
                    self.process(job, &cancel).await;
                    idle = min_idle;
                    continue;
                }
                Ok(None) => self.refresh_queue_depth().await,
                Err(e) => warn!(worker_id, error = %e, "Failed to claim job"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
            idle = (idle * 2).min(max_idle);
        }
    }

    async fn run_reaper(&self, lease: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reaper_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.deps.store.reclaim_stale(lease).await {
                        warn!(error = %e, "Failed to reclaim stale jobs");
                    }
                }
            }
        }
    }

    async fn refresh_queue_depth(&self) {
        match self.deps.store.stats().await {
            Ok(stats) => {
                for status in JobStatus::ALL {
                    self.deps.metrics.gauge(
                        QUEUE_DEPTH,
                        stats.get(status) as f64,
                        &[("status", status.as_str())],
                    );
                }
            }
            Err(e) => debug!(error = %e, "Failed to read queue stats"),
        }
    }

    async fn process(&self, job: Job, cancel: &CancellationToken) {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.deliver(&job, cancel))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(delivery_ref)) => self.on_sent(&job, &delivery_ref, started.elapsed()).await,
            Ok(Err(err)) => self.handle_failure(&job, err).await,
            Err(panic) => self.on_panic(&job, panic_message(panic.as_ref())).await,
        }
    }

    async fn deliver(&self, job: &Job, cancel: &CancellationToken) -> Result<String, DeliveryError> {
        self.limiter.wait(cancel).await?;
        let html = self
            .deps
            .renderer
            .render(&job.template_slug, &job.template_data)?;
        self.send_all(&job.recipients, &job.subject, &html).await
    }

    /// Send to each recipient independently and fold the failures together.
    async fn send_all(
        &self,
        recipients: &[String],
        subject: &str,
        html: &str,
    ) -> Result<String, DeliveryError> {
        let mut refs = Vec::with_capacity(recipients.len());
        let mut failures = Vec::new();

        for recipient in recipients {
            match self.deps.mailer.send(recipient, subject, html).await {
                Ok(delivery_ref) => {
                    if !delivery_ref.is_empty() {
                        refs.push(delivery_ref);
                    }
                }
                Err(failure) => failures.push(RecipientFailure {
                    recipient: recipient.clone(),
                    failure,
                }),
            }
        }

        if failures.is_empty() {
            Ok(refs.join(", "))
        } else {
            Err(DeliveryError::Send { failures })
        }
    }

    async fn on_sent(&self, job: &Job, delivery_ref: &str, elapsed: Duration) {
        if let Err(e) = self.deps.store.mark_sent(job.id, delivery_ref).await {
            error!(job_id = %job.id, error = %e, "Failed to mark job sent");
            return;
        }
        self.deps.events.record(job.id, EventType::Sent, delivery_ref);
        let labels = [("template", job.template_slug.as_str())];
        self.deps.metrics.inc(EMAILS_SENT_TOTAL, &labels);
        self.deps
            .metrics
            .observe(DELIVERY_DURATION_SECONDS, elapsed.as_secs_f64(), &labels);
        info!(
            job_id = %job.id,
            template = %job.template_slug,
            recipients = job.recipients.len(),
            attempt = job.attempts + 1,
            "Email sent"
        );
    }

    async fn handle_failure(&self, job: &Job, err: DeliveryError) {
        let attempts = job.attempts + 1;
        let permanent = err.is_permanent();
        let message = err.to_string();
        let template = job.template_slug.as_str();

        if permanent || job.remaining_attempts() <= 1 {
            let reason = if permanent { "permanent" } else { "exhausted" };
            if let Err(e) = self.deps.store.mark_failed(job.id, &message).await {
                error!(job_id = %job.id, error = %e, "Failed to mark job failed");
                return;
            }
            self.deps.events.record(job.id, EventType::Failed, &message);
            self.deps.metrics.inc(
                EMAILS_FAILED_TOTAL,
                &[("template", template), ("reason", reason), ("error", err.kind())],
            );
            warn!(job_id = %job.id, attempts, reason, error = %message, "Email failed");
            return;
        }

        // A shutdown interrupted the wait; put the job straight back.
        let backoff = match err {
            DeliveryError::Cancelled => Duration::ZERO,
            _ => self.policy.backoff(attempts),
        };
        let retry_at = add_duration(self.deps.clock.now(), backoff);
        if let Err(e) = self.deps.store.mark_retry(job.id, retry_at, &message).await {
            error!(job_id = %job.id, error = %e, "Failed to schedule retry");
            return;
        }
        self.deps.events.record(
            job.id,
            EventType::Retry,
            format!("attempt {attempts}, backoff {backoff:?}: {message}"),
        );
        self.deps.metrics.inc(
            EMAILS_RETRIED_TOTAL,
            &[("template", template), ("error", err.kind())],
        );
        info!(
            job_id = %job.id,
            attempts,
            retry_at = %retry_at,
            error = %message,
            "Email scheduled for retry"
        );
    }

    async fn on_panic(&self, job: &Job, info: String) {
        error!(job_id = %job.id, panic = %info, "Panic during delivery");
        let err = DeliveryError::Panicked(info);
        let message = err.to_string();
        if let Err(e) = self.deps.store.mark_failed(job.id, &message).await {
            error!(job_id = %job.id, error = %e, "Failed to mark panicked job failed");
            return;
        }
        self.deps.events.record(job.id, EventType::Failed, &message);
        self.deps.metrics.inc(
            EMAILS_FAILED_TOTAL,
            &[
                ("template", job.template_slug.as_str()),
                ("reason", "panic"),
                ("error", err.kind()),
            ],
        );
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::delivery::metrics::InMemoryMetrics;
    use crate::error::{RenderError, SendFailure};
    use crate::queue::NewJob;
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;

    struct EchoRenderer;

    impl Renderer for EchoRenderer {
        fn render(&self, slug: &str, _data: &Map<String, Value>) -> Result<String, RenderError> {
            Ok(format!("<p>{slug}</p>"))
        }
    }

    /// Fails recipients whose local part starts with `perm` or `temp`.
    struct PrefixMailer;

    #[async_trait]
    impl Mailer for PrefixMailer {
        async fn send(&self, recipient: &str, _subject: &str, _html: &str) -> Result<String, SendFailure> {
            if recipient.starts_with("perm") {
                Err(SendFailure::permanent("550", "mailbox unavailable"))
            } else if recipient.starts_with("temp") {
                Err(SendFailure::transient("421 try again later"))
            } else {
                Ok(format!("<{recipient}>"))
            }
        }
    }

    async fn engine() -> (DeliveryEngine, Arc<LibSqlBackend>, Arc<InMemoryMetrics>, ManualClock) {
        let clock = ManualClock::new();
        let store = Arc::new(
            LibSqlBackend::new_memory()
                .await
                .unwrap()
                .with_clock(Arc::new(clock.clone())),
        );
        let metrics = Arc::new(InMemoryMetrics::new());
        let deps = DeliveryDeps {
            store: store.clone(),
            renderer: Arc::new(EchoRenderer),
            mailer: Arc::new(PrefixMailer),
            events: EventRecorder::disabled(),
            metrics: metrics.clone(),
            clock: Arc::new(clock.clone()),
        };
        let config = DeliveryConfig {
            rate_limit_per_minute: 60_000,
            ..Default::default()
        };
        (DeliveryEngine::new(deps, config), store, metrics, clock)
    }

    async fn claimed(store: &LibSqlBackend, recipients: &[&str]) -> Job {
        store
            .enqueue(NewJob::new(
                "welcome",
                recipients.iter().map(|r| r.to_string()).collect(),
                "Hi",
            ))
            .await
            .unwrap();
        store.claim_next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn transient_failure_schedules_backoff() {
        let (engine, store, metrics, clock) = engine().await;
        let job = claimed(&store, &["temp@x.com"]).await;

        engine.shared.process(job.clone(), &CancellationToken::new()).await;

        let stored = store.get_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retry);
        assert_eq!(stored.attempts, 1);
        let expected = add_duration(clock.now(), Duration::from_secs(300));
        assert_eq!(stored.scheduled_at, Some(expected));
        assert_eq!(
            metrics.counter(
                EMAILS_RETRIED_TOTAL,
                &[("template", "welcome"), ("error", "send")]
            ),
            1
        );
    }

    #[tokio::test]
    async fn permanent_failure_fails_immediately() {
        let (engine, store, metrics, _clock) = engine().await;
        let job = claimed(&store, &["perm@x.com"]).await;

        engine.shared.process(job.clone(), &CancellationToken::new()).await;

        let stored = store.get_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.last_error.unwrap().contains("550"));
        assert_eq!(
            metrics.counter(
                EMAILS_FAILED_TOTAL,
                &[("template", "welcome"), ("reason", "permanent"), ("error", "send")]
            ),
            1
        );
    }

    #[tokio::test]
    async fn last_attempt_is_exhausted() {
        let (engine, store, metrics, _clock) = engine().await;
        let mut job = claimed(&store, &["temp@x.com"]).await;
        job.attempts = job.max_attempts - 1;

        engine.shared.process(job.clone(), &CancellationToken::new()).await;

        let stored = store.get_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            metrics.counter(
                EMAILS_FAILED_TOTAL,
                &[("template", "welcome"), ("reason", "exhausted"), ("error", "send")]
            ),
            1
        );
    }

    #[tokio::test]
    async fn mixed_recipients_fail_permanently() {
        let (engine, store, _metrics, _clock) = engine().await;
        let job = claimed(&store, &["ok@x.com", "temp@x.com", "perm@x.com"]).await;

        engine.shared.process(job.clone(), &CancellationToken::new()).await;

        let stored = store.get_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let error = stored.last_error.unwrap();
        assert!(error.contains("send to temp@x.com"));
        assert!(error.contains("send to perm@x.com: 550"));
        assert!(!error.contains("ok@x.com"));
    }

    #[tokio::test]
    async fn success_records_delivery_refs() {
        let (engine, store, metrics, _clock) = engine().await;
        let job = claimed(&store, &["a@x.com", "b@x.com"]).await;

        engine.shared.process(job.clone(), &CancellationToken::new()).await;

        let stored = store.get_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Sent);
        assert_eq!(stored.delivery_ref.as_deref(), Some("<a@x.com>, <b@x.com>"));
        let welcome = [("template", "welcome")];
        assert_eq!(metrics.counter(EMAILS_SENT_TOTAL, &welcome), 1);
        assert_eq!(metrics.histogram(DELIVERY_DURATION_SECONDS, &welcome).count, 1);
    }

    #[tokio::test]
    async fn cancelled_wait_requeues_without_backoff() {
        let (engine, store, _metrics, clock) = engine().await;
        let job = claimed(&store, &["a@x.com"]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        engine.shared.process(job.clone(), &cancel).await;

        let stored = store.get_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retry);
        assert_eq!(stored.scheduled_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn queue_depth_is_reported_per_status() {
        let (engine, store, metrics, _clock) = engine().await;
        let job = claimed(&store, &["a@x.com"]).await;
        store.mark_sent(job.id, "").await.unwrap();
        store
            .enqueue(NewJob::new("welcome", vec!["b@x.com".into()], "Hi"))
            .await
            .unwrap();
        store
            .enqueue(NewJob::new("welcome", vec!["c@x.com".into()], "Hi"))
            .await
            .unwrap();

        engine.shared.refresh_queue_depth().await;

        let depth = |status: &str| metrics.gauge_value(QUEUE_DEPTH, &[("status", status)]);
        assert_eq!(depth("pending"), Some(2.0));
        assert_eq!(depth("sent"), Some(1.0));
        assert_eq!(depth("processing"), Some(0.0));
        assert_eq!(depth("retry"), Some(0.0));
        assert_eq!(depth("failed"), Some(0.0));
        assert_eq!(metrics.gauge_value(QUEUE_DEPTH, &[]), None);
    }

    /// Holds every send until released.
    #[derive(Default)]
    struct GateMailer {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl Mailer for GateMailer {
        async fn send(&self, recipient: &str, _subject: &str, _html: &str) -> Result<String, SendFailure> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(format!("<{recipient}>"))
        }
    }

    #[tokio::test]
    async fn restart_waits_for_draining_workers() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mailer = Arc::new(GateMailer::default());
        let deps = DeliveryDeps {
            store: store.clone(),
            renderer: Arc::new(EchoRenderer),
            mailer: mailer.clone(),
            events: EventRecorder::disabled(),
            metrics: Arc::new(InMemoryMetrics::new()),
            clock: Arc::new(crate::clock::SystemClock),
        };
        let config = DeliveryConfig {
            rate_limit_per_minute: 60_000,
            ..Default::default()
        };
        let engine = Arc::new(DeliveryEngine::new(deps, config));
        let id = store
            .enqueue(NewJob::new("welcome", vec!["a@x.com".into()], "Hi"))
            .await
            .unwrap();

        assert!(engine.start(1));
        mailer.entered.notified().await;

        let stopping = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.stop().await })
        };
        while engine.state.lock().is_some() {
            tokio::task::yield_now().await;
        }

        assert!(engine.is_running());
        assert!(!engine.start(1), "old worker is still in flight");

        mailer.release.notify_one();
        stopping.await.unwrap();

        assert!(!engine.is_running());
        let job = store.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Sent);

        assert!(engine.start(1));
        engine.stop().await;
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
