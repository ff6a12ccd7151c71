//! Rushtix booking platform server.
//!
//! Wires the production stack (Postgres repositories, the Redis
//! reservation engine and waiting room, the Redpanda bus) into the
//! ingress router and the background fleet: outbox relay and cleanup,
//! expiry sweeper, queue ticker, inventory sync, payment-events
//! consumers, the post-payment saga executor and orchestrator.
//!
//! Shutdown: SIGINT/SIGTERM flips the root watch channel; the HTTP
//! server drains in-flight requests and the background tasks are given
//! the configured window (default 30 s) before the process exits.

mod config;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use config::Config;
use metrics_exporter_prometheus::PrometheusBuilder;
use rushtix_core::{
    AdmissionQueue, BookingRepository, Clock, EventPublisher, IdempotencyBackend, OutboxStore,
    ReservationStore, SagaStore, SystemClock, ZoneRepository,
};
use rushtix_redpanda::{BusProducer, ConsumerPool, ConsumerPoolConfig, topics};
use rushtix_relay::{OutboxRelay, RelayConfig};
use rushtix_saga::{Orchestrator, ReplyHandler, definition::post_payment};
use rushtix_web::middleware::{
    IngressLimiter, LocalRateLimiter, RateLimitRule, RateLimiterBackend,
};
use rushtix_web::{AppState, BookingSettings, TokenVerifier};
use rushtix_workers::{
    ExpirySweeper, InventoryBatcher, InventorySyncHandler, PaymentEventsHandler,
    PostPaymentExecutor, QueueReleaseTicker,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.server.metrics_port))
        .install()
        .context("failed to install metrics exporter")?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "rushtix server starting"
    );

    // Shared infrastructure
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pool = rushtix_postgres::connect(&config.postgres).await?;
    let redis = rushtix_redis::connect(&config.redis.url).await?;
    let producer = BusProducer::builder()
        .brokers(&config.redpanda.brokers)
        .build()?;
    let publisher: Arc<dyn EventPublisher> = Arc::new(producer.clone());

    // Stores
    let bookings: Arc<dyn BookingRepository> =
        Arc::new(rushtix_postgres::PostgresBookingRepository::new(pool.clone()));
    let zones: Arc<dyn ZoneRepository> =
        Arc::new(rushtix_postgres::PostgresZoneRepository::new(pool.clone()));
    let outbox: Arc<dyn OutboxStore> =
        Arc::new(rushtix_postgres::PostgresOutboxStore::new(pool.clone()));
    let saga_store: Arc<dyn SagaStore> =
        Arc::new(rushtix_postgres::PostgresSagaStore::new(pool));
    let reservations: Arc<dyn ReservationStore> =
        Arc::new(rushtix_redis::ReservationEngine::new(redis.clone()));
    let queue: Arc<dyn AdmissionQueue> = Arc::new(rushtix_redis::QueueAdmission::new(
        redis.clone(),
        rushtix_redis::QueueConfig {
            max_concurrent: config.queue.max_concurrent,
            pass_ttl: config.queue.pass_ttl,
            release_interval: config.queue.release_interval,
            ..rushtix_redis::QueueConfig::default()
        },
        config.auth.queue_jwt_secret.as_bytes(),
    ));
    let idempotency: Arc<dyn IdempotencyBackend> =
        Arc::new(rushtix_redis::IdempotencyStore::new(redis.clone()));

    // Redis counters and the relational projection converge on the
    // bookings table before traffic is admitted.
    rushtix_workers::reconcile(&zones, &reservations).await?;

    // Background fleet
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let relay = Arc::new(OutboxRelay::new(
        Arc::clone(&outbox),
        Arc::clone(&publisher),
        Arc::clone(&clock),
        RelayConfig::default(),
    ));
    {
        let relay = Arc::clone(&relay);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { relay.run(rx).await }));
    }
    {
        let relay = Arc::clone(&relay);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { relay.run_cleanup(rx).await }));
    }

    let sweeper = Arc::new(ExpirySweeper::new(
        Arc::clone(&bookings),
        Arc::clone(&reservations),
        Arc::clone(&clock),
    ));
    tasks.push(tokio::spawn(sweeper.run(shutdown_rx.clone())));

    let ticker = Arc::new(QueueReleaseTicker::new(
        Arc::clone(&queue),
        Arc::clone(&clock),
        config.queue.release_interval,
    ));
    tasks.push(tokio::spawn(ticker.run(shutdown_rx.clone())));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&saga_store),
        Arc::clone(&publisher),
        Arc::clone(&clock),
        vec![post_payment()],
    ));
    let recovered = orchestrator.recover().await?;
    if recovered > 0 {
        tracing::info!(recovered, "re-dispatched in-flight sagas");
    }
    {
        let orchestrator = Arc::clone(&orchestrator);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            orchestrator
                .run_timeout_sweeper(Duration::from_secs(5), rx)
                .await;
        }));
    }

    // Consumer pools
    let pool_config = |group: &str, topics: Vec<String>| ConsumerPoolConfig {
        brokers: config.redpanda.brokers.clone(),
        group_id: format!("{}-{group}", config.redpanda.group_prefix),
        topics,
        pool_size: config.redpanda.pool_size,
        ..ConsumerPoolConfig::default()
    };

    let payment_pool = ConsumerPool::new(
        pool_config(
            "payment-events",
            vec![topics::PAYMENT_EVENTS.to_string(), topics::SEAT_RELEASE.to_string()],
        ),
        producer.clone(),
    );
    tasks.extend(payment_pool.spawn(
        Arc::new(PaymentEventsHandler::new(
            Arc::clone(&bookings),
            Arc::clone(&reservations),
            Arc::clone(&orchestrator),
            Arc::clone(&clock),
        )),
        shutdown_rx.clone(),
    )?);

    let (delta_tx, batcher) = InventoryBatcher::channel(Arc::clone(&zones), 10_000);
    tasks.push(tokio::spawn(batcher.run(shutdown_rx.clone())));
    let inventory_pool = ConsumerPool::new(
        pool_config("inventory-sync", vec![topics::BOOKING_EVENTS.to_string()]),
        producer.clone(),
    );
    tasks.extend(inventory_pool.spawn(
        Arc::new(InventorySyncHandler::new(delta_tx)),
        shutdown_rx.clone(),
    )?);

    let executor_pool = ConsumerPool::new(
        pool_config("saga-executor", vec![topics::saga_commands("post-payment")]),
        producer.clone(),
    );
    tasks.extend(executor_pool.spawn(
        Arc::new(PostPaymentExecutor::new(
            Arc::clone(&bookings),
            Arc::clone(&reservations),
            Arc::clone(&publisher),
            Arc::clone(&clock),
        )),
        shutdown_rx.clone(),
    )?);

    let reply_pool = ConsumerPool::new(
        pool_config("saga-orchestrator", vec![topics::saga_events("post-payment")]),
        producer,
    );
    tasks.extend(reply_pool.spawn(
        Arc::new(ReplyHandler::new(Arc::clone(&orchestrator))),
        shutdown_rx.clone(),
    )?);

    // Ingress
    let backend = if config.rate_limit.distributed {
        RateLimiterBackend::Distributed(rushtix_redis::DistributedRateLimiter::new(redis))
    } else {
        let local = Arc::new(LocalRateLimiter::default());
        tasks.push(tokio::spawn(
            Arc::clone(&local).run_sweeper(shutdown_rx.clone()),
        ));
        RateLimiterBackend::Local(local)
    };
    let limiter = Arc::new(IngressLimiter::new(
        vec![RateLimitRule {
            name: "bookings".to_string(),
            pattern: "/api/v1/bookings/**".to_string(),
            methods: vec![Method::POST],
            requests_per_second: f64::from(config.rate_limit.booking_requests_per_minute) / 60.0,
            burst: config.rate_limit.booking_burst,
        }],
        RateLimitRule {
            name: "default".to_string(),
            pattern: "/**".to_string(),
            methods: vec![],
            requests_per_second: f64::from(config.rate_limit.requests_per_minute) / 60.0,
            burst: config.rate_limit.burst,
        },
        backend,
    ));

    let state = AppState {
        bookings,
        zones,
        reservations,
        queue,
        idempotency,
        limiter,
        concurrency: Arc::new(tokio::sync::Semaphore::new(
            config.server.max_concurrent_requests,
        )),
        verifier: Arc::new(TokenVerifier::new(config.auth.jwt_secret.as_bytes())),
        clock,
        settings: BookingSettings {
            max_tickets_per_user: config.booking.max_tickets_per_user,
            reservation_ttl: config.booking.reservation_ttl,
            ..BookingSettings::default()
        },
    };

    let app = rushtix_web::router(state, cors_layer(&config.server.cors_allowed_origins));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    // Give the background fleet the drain window, then leave.
    tracing::info!("draining background tasks");
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(config.server.shutdown_timeout, drain)
        .await
        .is_err()
    {
        tracing::warn!("drain window elapsed, forcing exit");
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT/SIGTERM, flipping the root shutdown channel first
/// so the background fleet stops alongside the HTTP drain.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

fn cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins.trim() == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .filter_map(|o| o.trim().parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}
