//! Startup wiring for the trade-capture ingress daemon:
//! store -> stream client -> classifier -> buffer -> persistence -> breaker
//! -> sizer -> dispatcher -> stream adapter start -> HTTP admin server.
//! Every step is fallible and propagated with `?`; startup is fatal on any
//! wiring error.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tci_admin::AdminState;
use tci_breaker::{BreakerConfig, CircuitBreaker};
use tci_buffer::{AdaptiveBatchSizer, IngestionBuffer, IngestionBufferReceiver};
use tci_bus::{BusProducer, KafkaBusProducer};
use tci_config::secrets::ResolvedEnv;
use tci_dispatch::{DispatchConfig, DispatchWorker};
use tci_persist::{DiskLog, PersistError, PersistenceCore};
use tci_schemas::PendingMessage;
use tci_stream::{KafkaStreamTransport, StreamTransport};
use tokio::time::Instant;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};

const DISK_LOG_PATH: &str = "var/tci-lost-messages.jsonl";

/// Construct every component in dependency order and run the daemon until
/// it is killed. Returns only on unrecoverable startup error or if the HTTP
/// server itself exits.
pub async fn run() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let config_paths = config_paths_from_env();
    let path_refs: Vec<&str> = config_paths.iter().map(String::as_str).collect();
    let loaded = tci_config::load_layered_yaml(&path_refs)
        .with_context(|| format!("loading config from {config_paths:?}"))?;
    let cfg = loaded.ingress.clone();
    info!(config_hash = %loaded.config_hash, "configuration loaded");

    let secrets = ResolvedEnv::from_env().context("resolving environment secrets")?;

    // store
    let pool = tci_db::connect(&secrets.database_url)
        .await
        .context("connecting to Postgres")?;
    tci_db::migrate(&pool).await.context("running tci-db migrations")?;

    // stream client
    let stream: Arc<dyn StreamTransport> = Arc::new(
        KafkaStreamTransport::connect(
            &secrets.kafka_bootstrap_servers,
            &cfg.stream_name,
            &cfg.consumer_name,
        )
        .context("connecting source stream")?,
    );

    // classifier: `tci_classify::classify` is a free function, nothing to wire.

    // buffer
    let (buffer, buffer_rx) = IngestionBuffer::new(
        cfg.buffer_capacity,
        Duration::from_millis(cfg.enqueue_wait_ms),
    );
    let buffer = Arc::new(buffer);

    // persistence (wraps the breaker internally)
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
        failure_rate_threshold: cfg.breaker_failure_rate,
        open_duration: Duration::from_millis(cfg.breaker_open_duration_ms),
        ..BreakerConfig::default()
    }));
    let disk_log = DiskLog::new(DISK_LOG_PATH).context("opening persistence disk log")?;
    let persistence = Arc::new(PersistenceCore::new(pool.clone(), breaker.clone(), disk_log));

    // sizer (one instance governs the ingestion flush; the dispatcher owns
    // its own independent instance, built below)
    let ingest_sizer = Arc::new(AdaptiveBatchSizer::new(
        cfg.batch_min,
        cfg.batch_max,
        Duration::from_millis(cfg.target_latency_ms),
    ));

    let bus_producer: Arc<dyn BusProducer> =
        Arc::new(KafkaBusProducer::connect(&secrets.kafka_bootstrap_servers, &cfg.dest_topic)
            .context("connecting downstream bus producer")?);

    // dispatcher
    let dispatch_sizer = AdaptiveBatchSizer::new(
        cfg.batch_min,
        cfg.batch_max,
        Duration::from_millis(cfg.target_latency_ms),
    );
    let dispatch_config = DispatchConfig {
        initial_backoff: Duration::from_millis(cfg.system_failure_backoff_ms),
        max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        idle_interval: Duration::from_millis(cfg.dispatch_idle_interval_ms),
        publish_timeout: Duration::from_millis(cfg.pub_timeout_ms),
    };
    let dispatcher = Arc::new(DispatchWorker::new(
        pool.clone(),
        bus_producer,
        dispatch_sizer,
        dispatch_config,
    ));

    // stream adapter start: spawn the receive loop before serving admin
    // traffic so replay/backpressure interact with a live consumer.
    let shutting_down = Arc::new(AtomicBool::new(false));
    tokio::spawn(stream_receive_loop(
        stream.clone(),
        buffer.clone(),
        pool.clone(),
        shutting_down.clone(),
    ));
    tokio::spawn(flush_loop(
        buffer_rx,
        stream.clone(),
        persistence,
        ingest_sizer,
        Duration::from_millis(cfg.flush_interval_ms),
    ));
    {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await });
    }

    tokio::spawn(shutdown_watcher(shutting_down));

    // HTTP admin server
    let admin_state = Arc::new(AdminState { buffer });
    let app = tci_admin::build_router(admin_state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr: SocketAddr = secrets
        .admin_bind_addr
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("tci-daemon admin endpoint listening on http://{addr}");

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("admin server crashed")?;

    dispatcher.stop();
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn config_paths_from_env() -> Vec<String> {
    match std::env::var("TCI_CONFIG_PATHS") {
        Ok(raw) => raw.split(',').map(str::to_string).collect(),
        Err(_) => vec!["crates/tci-daemon/config/default.yaml".to_string()],
    }
}

/// Flips `shutting_down` once a Ctrl-C is observed, so the stream-receive
/// loop switches a blocked enqueue into a quarantine-and-drop instead of
/// pausing the transport forever.
async fn shutdown_watcher(shutting_down: Arc<AtomicBool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("shutdown signal received, draining in progress work");
        shutting_down.store(true, Ordering::SeqCst);
    }
}

/// Pulls raw messages off the source stream, classifies them, and hands them
/// to the buffer. On a sustained full buffer it pauses the transport
/// (backpressure); during shutdown it quarantines the message directly
/// instead of blocking forever.
async fn stream_receive_loop(
    stream: Arc<dyn StreamTransport>,
    buffer: Arc<IngestionBuffer>,
    pool: sqlx::PgPool,
    shutting_down: Arc<AtomicBool>,
) {
    let mut paused = false;
    loop {
        let stream_msg = match stream.recv().await {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "stream recv failed");
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
        };

        let classified = tci_classify::classify(&stream_msg.raw_bytes);
        let mut pending = PendingMessage {
            classified: classified.into(),
            raw_bytes: stream_msg.raw_bytes,
            offset: stream_msg.offset,
            ack_handle: Some(stream_msg.ack_handle),
        };

        loop {
            match buffer.try_enqueue(pending).await {
                Ok(()) => {
                    if paused {
                        if let Err(e) = stream.resume() {
                            warn!(error = %e, "failed to resume stream after backpressure");
                        }
                        paused = false;
                    }
                    break;
                }
                Err((returned, _timed_out)) => {
                    if shutting_down.load(Ordering::SeqCst) {
                        if let Err(e) = tci_db::quarantine_independent(
                            &pool,
                            &returned.raw_bytes,
                            "buffer-full shutdown",
                            "stream-receive",
                        )
                        .await
                        {
                            error!(error = %e, "failed to quarantine message during shutdown drain");
                        }
                        break;
                    }
                    if !paused {
                        if let Err(e) = stream.pause() {
                            warn!(error = %e, "failed to pause stream under backpressure");
                        }
                        paused = true;
                    }
                    pending = returned;
                }
            }
        }
    }
}

/// Drains the ingestion buffer on the adaptive batch target or the flush
/// timer, whichever comes first, and hands each batch to `PersistenceCore`.
/// On `CallNotPermitted`/`SystemFailure` it pauses the stream and retries the
/// same batch untouched rather than dropping any of it.
async fn flush_loop(
    mut rx: IngestionBufferReceiver,
    stream: Arc<dyn StreamTransport>,
    persistence: Arc<PersistenceCore>,
    sizer: Arc<AdaptiveBatchSizer>,
    flush_interval: Duration,
) {
    loop {
        let deadline = Instant::now() + flush_interval;
        let batch = rx.drain_batch(sizer.current_size(), deadline).await;
        if batch.is_empty() {
            sizer.reset();
            continue;
        }

        let started = Instant::now();
        loop {
            match persistence.persist_batch(&batch).await {
                Ok(()) => break,
                Err(PersistError::CallNotPermitted) => {
                    let _ = stream.pause();
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Err(PersistError::SystemFailure(e)) => {
                    warn!(error = %e, "persist_batch system failure, pausing and retrying");
                    let _ = stream.pause();
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
        let _ = stream.resume();

        for msg in &batch {
            if let Some(ack) = msg.ack_handle {
                if let Err(e) = stream.store_offset(ack) {
                    error!(error = %e, "store_offset failed after successful persist");
                }
            }
        }

        let observed = started.elapsed();
        sizer.record_flush(observed, batch.len());
        info!(batch_size = batch.len(), latency_ms = observed.as_millis(), "ingestion batch flushed");
    }
}
