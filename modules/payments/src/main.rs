use std::net::SocketAddr;
use std::sync::Arc;

use event_bus::consumer_retry::RetryConfig;
use event_bus::InMemoryBus;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use payments_core_rs::{
    config::{Config, StoreType},
    events::{PaymentBus, SOURCE_MODULE},
    gateway::PaymentGatewayManager,
    store::{MemoryStore, PaymentStore, PgStore},
    worker::{self, webhook_queue, SchedulerConfig, WebhookWorker, WEBHOOK_QUEUE_CAPACITY},
    PaymentsContext,
};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    let config = Config::from_env().expect("Failed to load configuration from environment");
    init_tracing(config.log_json);

    tracing::info!(
        host = %config.host,
        port = config.port,
        store = ?config.store_type,
        default_gateway = %config.default_gateway,
        "Starting payments core"
    );

    let store: Arc<dyn PaymentStore> = match config.store_type {
        StoreType::Memory => {
            tracing::warn!("Using in-memory store; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
        StoreType::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .expect("DATABASE_URL must be set");

            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .expect("Failed to connect to database");

            tracing::info!("Running migrations...");
            sqlx::migrate!("./db/migrations")
                .run(&pool)
                .await
                .expect("Failed to run migrations");

            Arc::new(PgStore::new(pool))
        }
    };

    let gateways = Arc::new(
        PaymentGatewayManager::from_config(&config).expect("Failed to configure payment gateways"),
    );
    let bus: PaymentBus = Arc::new(InMemoryBus::with_retry(SOURCE_MODULE, RetryConfig::default()));

    let (queue_tx, queue_rx) = webhook_queue(WEBHOOK_QUEUE_CAPACITY);
    let context = PaymentsContext::new(&config, store.clone(), gateways, bus, Some(queue_tx.clone()))
        .expect("Failed to subscribe payments listeners");

    // Deliveries left Pending by a previous run
    match worker::webhook_worker::requeue_pending(
        store.as_ref(),
        &queue_tx,
        chrono::Utc::now(),
        WEBHOOK_QUEUE_CAPACITY as i64,
    )
    .await
    {
        Ok(count) => tracing::info!(count, "Startup webhook requeue finished"),
        Err(e) => tracing::error!(error = %e, "Startup webhook requeue failed"),
    }

    WebhookWorker::new(context.processor.clone(), RetryConfig::default()).spawn(queue_rx);

    let scheduler = context.scheduler(SchedulerConfig::from(&config));
    tokio::spawn(scheduler.run());

    let app = context.router();

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("HOST and PORT must form a valid socket address");
    tracing::info!("Payments core listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server failed to start");

    tracing::info!("Payments core stopped");
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
