use axum::{extract::State, http::Method, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    autopilot::AutopilotEngine,
    budget::BudgetMeter,
    communications::{EscalationRouter, RuleTriage},
    config::Config,
    database::DbPool,
    error::Result,
    runs::{Collaborators, RunController},
    shift::ShiftScheduler,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub controller: RunController,
    pub router: EscalationRouter,
    pub autopilot: AutopilotEngine,
    pub budget: BudgetMeter,
    pub scheduler: ShiftScheduler,
}

impl AppState {
    /// Wires every component over one pool.
    pub fn new(config: Config, db: DbPool, collaborators: Collaborators) -> Self {
        let budget = BudgetMeter::new(db.clone(), config.budget.clone());
        let router = EscalationRouter::new(db.clone());
        let controller = RunController::new(
            db.clone(),
            config.runs.clone(),
            collaborators,
            budget.clone(),
            router.clone(),
        );
        let autopilot = AutopilotEngine::new(db.clone(), controller.clone(), router.clone());
        let scheduler = ShiftScheduler::new(
            db.clone(),
            config.scheduler.clone(),
            controller.clone(),
            autopilot.clone(),
            router.clone(),
            budget.clone(),
            Arc::new(RuleTriage),
        );

        Self {
            config,
            db,
            controller,
            router,
            autopilot,
            budget,
            scheduler,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ])
        .allow_origin(axum::http::header::HeaderValue::from_static("*"));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", crate::api::create_api_router())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)) // 1 MiB
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    let db = crate::database::create_pool(&config.database_url()).await?;
    let collaborators = Collaborators::from_config(&config);
    let state = AppState::new(config.clone(), db, collaborators);

    if config.scheduler.reconcile {
        recover_runs(&state).await?;
    }
    spawn_scheduler(&state);

    let app = create_app(state);

    let address = config.server_address();
    info!("Server listening on {}", address);

    let listener = tokio::net::TcpListener::bind(&address).await?;

    match axum::serve(listener, app).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => error!("Server error: {}", e),
    }

    Ok(())
}

/// Fails runs orphaned by the previous process and restarts queued ones.
async fn recover_runs(state: &AppState) -> Result<()> {
    let orphaned = state.controller.reconcile_orphans().await?;
    if !orphaned.is_empty() {
        warn!("Marked {} orphaned runs as failed", orphaned.len());
    }

    let resumed = state.controller.resume_queued().await?;
    if resumed > 0 {
        info!("Resumed {} queued runs", resumed);
    }
    Ok(())
}

fn spawn_scheduler(state: &AppState) {
    let scheduler = state.scheduler.clone();
    let period = Duration::from_secs(state.config.scheduler.tick_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = scheduler.tick().await {
                error!("Scheduler tick failed: {}", e);
            }
        }
    });
    info!("Scheduler running every {:?}", period);
}

async fn health_check(State(state): State<AppState>) -> Result<Json<Value>> {
    let db_version = match crate::database::schema::get_database_info(&state.db).await {
        Ok(version) => version,
        Err(e) => {
            error!("Database health check failed: {}", e);
            return Ok(Json(json!({
                "status": "unhealthy",
                "service": "foreman",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "error": "Database connection failed"
            })));
        }
    };

    Ok(Json(json!({
        "status": "healthy",
        "service": "foreman",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "database": {
            "version": db_version,
            "status": "connected"
        }
    })))
}
