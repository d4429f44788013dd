use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod database;
mod error;
mod handlers;
mod services;
mod workflows;

#[cfg(test)]
mod tests;

pub use error::{ApiError, AppError, AppResult};

use workflows::{
    Collaborators, EnrollmentManager, ExecutionScheduler, SchedulerConfig, StepInterpreter,
    TriggerEvaluator, WorkflowStore,
};

pub struct AppState {
    pub store: Arc<WorkflowStore>,
    pub enrollments: Arc<EnrollmentManager>,
    pub triggers: Arc<TriggerEvaluator>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::connect(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let store = Arc::new(WorkflowStore::new(db_pool.clone()));
    let enrollments = Arc::new(EnrollmentManager::new(db_pool.clone()));
    let triggers = Arc::new(TriggerEvaluator::new(store.clone(), enrollments.clone()));

    let form_base_url = std::env::var("FORM_BASE_URL")
        .unwrap_or_else(|_| "https://app.camphq.example.com".to_string());
    let messaging = services::MessagingService::new(&config.smtp, config.sms.clone(), form_base_url)
        .map_err(|e| anyhow::anyhow!("messaging setup failed: {}", e))?;

    let collaborators = Collaborators {
        messaging: Arc::new(messaging),
        records: Arc::new(workflows::collaborators::PgRecordMutator::new(db_pool.clone())),
        webhooks: Arc::new(workflows::collaborators::HttpWebhookCaller::new()),
        tasks: Arc::new(workflows::collaborators::PgTaskCreator::new(db_pool.clone())),
        enroller: enrollments.clone(),
    };

    let interpreter = Arc::new(StepInterpreter::new(
        collaborators,
        Duration::from_secs(config.engine.action_timeout_secs),
    ));

    let scheduler_config = SchedulerConfig {
        poll_interval: Duration::from_secs(config.engine.poll_interval_secs),
        batch_size: config.engine.batch_size,
        concurrency: config.engine.worker_concurrency,
        lease: Duration::from_secs(config.engine.lease_secs),
        max_step_retries: config.engine.max_step_retries,
        retry_backoff: Duration::from_secs(config.engine.retry_backoff_secs),
    };

    for n in 0..config.engine.worker_count {
        let worker = Arc::new(ExecutionScheduler::new(
            store.clone(),
            interpreter.clone(),
            format!("worker-{}", n),
            scheduler_config.clone(),
        ));
        tokio::spawn(worker.run());
    }

    tokio::spawn(workflows::scheduler::run_schedule_loop(
        triggers.clone(),
        Duration::from_secs(config.engine.schedule_tick_secs),
    ));

    let app_state = Arc::new(AppState {
        store,
        enrollments,
        triggers,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .nest(
            "/api/v1",
            Router::new()
                .merge(handlers::workflows::workflow_routes())
                .merge(handlers::executions::execution_routes()),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    info!("CampHQ workflow engine listening on {}", config.server_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}
