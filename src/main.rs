use std::sync::Arc;

use anyhow::Context;

use mail_relay::clock::SystemClock;
use mail_relay::config::{DeliveryConfig, MetricsConfig, SmtpConfig, StoreConfig};
use mail_relay::delivery::metrics::init_otlp_exporter;
use mail_relay::delivery::{
    DeliveryDeps, DeliveryEngine, EventRecorder, EventRecorderConfig, OtelMetrics,
};
use mail_relay::mail::{SmtpMailer, smtp::install_crypto_provider, validate_html};
use mail_relay::render::TemplateDirRenderer;
use mail_relay::store::{JobStore, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    install_crypto_provider();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let delivery_config = DeliveryConfig::from_env()?;
    let store_config = StoreConfig::from_env();
    let metrics_config = MetricsConfig::from_env();
    let Some(smtp_config) = SmtpConfig::from_env()? else {
        eprintln!("Error: SMTP_HOST not set");
        eprintln!("  export SMTP_HOST=smtp.example.com SMTP_USERNAME=... SMTP_PASSWORD=...");
        std::process::exit(1);
    };

    eprintln!("📬 Mail Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", store_config.db_path.display());
    eprintln!("   Templates: {}", store_config.template_path.display());
    eprintln!("   SMTP: {}:{}", smtp_config.host, smtp_config.port);
    eprintln!(
        "   Workers: {} (rate limit {}/min, max {} attempts)",
        delivery_config.worker_count,
        delivery_config.rate_limit_per_minute,
        delivery_config.max_retries
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store = Arc::new(
        LibSqlBackend::new_local(&store_config.db_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open database at {}",
                    store_config.db_path.display()
                )
            })?
            .with_default_max_attempts(delivery_config.max_retries),
    );

    let stats = store.stats().await?;
    eprintln!(
        "   Queue: {} open ({} pending, {} retry, {} processing)\n",
        stats.depth(),
        stats.pending,
        stats.retry,
        stats.processing
    );

    // ── Templates ────────────────────────────────────────────────────────
    let template_dir = store_config.template_path.clone();
    let renderer = tokio::task::spawn_blocking(move || TemplateDirRenderer::load(&template_dir))
        .await?
        .with_context(|| {
            format!(
                "Failed to load templates from {}",
                store_config.template_path.display()
            )
        })?;
    lint_templates(&renderer);

    // ── Metrics ──────────────────────────────────────────────────────────
    let meter_provider = match &metrics_config.endpoint {
        Some(endpoint) => {
            let provider = init_otlp_exporter(endpoint)?;
            opentelemetry::global::set_meter_provider(provider.clone());
            tracing::info!(endpoint = %endpoint, "Exporting metrics over OTLP");
            Some(provider)
        }
        None => {
            tracing::info!("MAIL_METRICS_ENDPOINT not set, metrics are not exported");
            None
        }
    };

    // ── Delivery engine ─────────────────────────────────────────────────
    let events = EventRecorder::spawn(store.clone(), EventRecorderConfig::default());
    let deps = DeliveryDeps {
        store: store.clone(),
        renderer: Arc::new(renderer),
        mailer: Arc::new(SmtpMailer::new(&smtp_config)?),
        events: events.clone(),
        metrics: Arc::new(OtelMetrics::from_global()),
        clock: Arc::new(SystemClock),
    };

    let worker_count = delivery_config.worker_count;
    let engine = DeliveryEngine::new(deps, delivery_config);
    engine.start(worker_count);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received");
    engine.stop().await;
    events.close().await;

    if let Some(provider) = meter_provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "Failed to flush metrics on shutdown");
        }
    }

    Ok(())
}

/// Log email-client compatibility findings for every loaded template.
fn lint_templates(renderer: &TemplateDirRenderer) {
    for (slug, html) in renderer.templates() {
        for issue in validate_html(html) {
            tracing::debug!(template = slug, issue = %issue, "Template lint");
        }
    }
}
