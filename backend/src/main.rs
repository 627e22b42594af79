use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod automations;
mod config;
mod database;
mod distribution;
mod error;
mod handlers;
mod jobs;
mod notifications;
mod outbox;
mod pagination;

pub use error::{ApiError, ApiResult, AppError};
pub use pagination::{PaginatedResponse, PaginationMeta, PaginationParams};

#[cfg(test)]
mod tests;

use automations::{AutomationEngine, NodeProcessor};
use distribution::LeadDistributor;
use outbox::{DeliveryWorker, HttpMessageGateway, Outbox, SmtpMailer};

pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub engine: Arc<AutomationEngine>,
    pub distributor: Arc<LeadDistributor>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let outbox = Outbox::new(db_pool.clone());
    let processor = NodeProcessor::new(
        db_pool.clone(),
        outbox.clone(),
        config.gateway.webhook_secret.clone(),
    );
    let engine = Arc::new(AutomationEngine::new(db_pool.clone(), processor));
    let distributor = Arc::new(LeadDistributor::new(db_pool.clone(), engine.clone()));

    let gateway = Arc::new(HttpMessageGateway::new(config.gateway.clone()));
    let mailer = Arc::new(SmtpMailer::new(&config.smtp).map_err(|e| anyhow::anyhow!("{}", e))?);
    let delivery = Arc::new(DeliveryWorker::new(db_pool.clone(), gateway, mailer));

    let scheduler = jobs::JobScheduler::new(
        engine.clone(),
        distributor.clone(),
        delivery,
        jobs::JobConfig::default(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("{}", e))?;
    scheduler.start().await.map_err(|e| anyhow::anyhow!("{}", e))?;

    let app_state = Arc::new(AppState {
        db_pool,
        engine,
        distributor,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Lattice CRM API v1.0.0" }))
        .route("/health", get(handlers::health_check))
        .route("/api/v1/events", post(handlers::events::ingest_event))
        .nest("/api/v1/automations", handlers::automations::automation_routes())
        .nest("/api/v1/executions", handlers::automations::execution_routes())
        .nest("/api/v1/queues", handlers::queues::queue_routes())
        .nest("/api/v1/assignments", handlers::queues::assignment_routes())
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
