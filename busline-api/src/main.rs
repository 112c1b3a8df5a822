use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use busline_api::metrics::Metrics;
use busline_api::state::{booking_settings, dispatch_settings};
use busline_api::{app, worker, AppState};
use busline_booking::Services;
use busline_core::clock::SystemClock;
use busline_store::retry::RetryPolicy;
use busline_store::{
    Config, DbClient, EventProducer, HttpPaymentGateway, HttpTripCatalog, HttpUserDirectory, KafkaNotifier,
    PgBookingRepository, PgDelayedQueue, RedisSeatLockStore,
};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "busline_api=debug,busline_booking=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Busline API on port {}", config.server.port);

    // Postgres
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    // Redis
    let locks = RedisSeatLockStore::new(&config.redis.url).context("Invalid Redis URL")?;
    locks.ping().await.context("Failed to connect to Redis")?;

    // Kafka
    let producer = EventProducer::new(&config.kafka.brokers).context("Failed to create Kafka producer")?;
    let notifier = KafkaNotifier::new(producer, config.kafka.notification_topic.clone());

    // Collaborators
    let collaborators = &config.collaborators;
    let retry = RetryPolicy {
        attempts: collaborators.max_attempts,
        initial_delay: Duration::from_millis(collaborators.initial_backoff_ms),
        timeout: Duration::from_millis(collaborators.request_timeout_ms),
        ..RetryPolicy::default()
    };
    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(collaborators.request_timeout_ms))
        .build()
        .context("Failed to build HTTP client")?;

    let services = Services {
        bookings: Arc::new(PgBookingRepository::new(db.pool.clone())),
        locks: Arc::new(locks),
        queue: Arc::new(PgDelayedQueue::new(db.pool.clone())),
        trips: Arc::new(HttpTripCatalog::new(http.clone(), &collaborators.trip_service_url, retry.clone())),
        users: Arc::new(HttpUserDirectory::new(http.clone(), &collaborators.user_service_url, retry.clone())),
        payments: Arc::new(HttpPaymentGateway::new(http, &collaborators.payment_service_url, retry)),
        notifier: Arc::new(notifier),
        clock: Arc::new(SystemClock),
    };

    let state = AppState::new(
        services,
        booking_settings(&config)?,
        dispatch_settings(&config)?,
        Metrics::new().context("Failed to register metrics")?,
    );

    // Background workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(worker::run_sweeper(
        state.clone(),
        Duration::from_secs(config.workers.sweep_interval_secs),
        shutdown_rx.clone(),
    ));
    let dispatcher = tokio::spawn(worker::run_reminder_dispatcher(
        state.clone(),
        Duration::from_secs(config.workers.reminder_poll_interval_secs),
        shutdown_rx,
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app(state).into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(sweeper, dispatcher);
    tracing::info!("Busline API stopped");
    Ok(())
}
