// src/main.rs
// Warehouse placement ledger: HTTP server, startup and routing
use actix_cors::Cors;
use actix_web::http::header;
use actix_web::middleware::{Compress, DefaultHeaders, Logger};
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{migrate::MigrateDatabase, Sqlite, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Module declarations
mod actor;
mod audit;
mod config;
mod db;
mod error;
mod handlers;
mod ledger;
mod locks;
mod models;
mod monitoring;
mod node_handlers;
mod placement;
mod placement_handlers;
mod repositories;
mod reservation;

use config::{load_config, Config};
use monitoring::{start_maintenance_tasks, Metrics, RequestLogger};
use placement::PlacementEngine;
use repositories::SqlitePlacementRepository;

pub struct AppState {
    pub db_pool: SqlitePool,
    pub config: Config,
    pub engine: Arc<PlacementEngine>,
}

// ==================== ROUTES ====================

/// Все эндпоинты `/api/v1`. Актор берётся из заголовков шлюза в каждом обработчике.
pub fn configure_api(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            // Placement operations
            .route("/receptions", web::post().to(placement_handlers::create_reception))
            .route("/issues", web::post().to(placement_handlers::issue_stock))
            .route("/movements", web::get().to(placement_handlers::get_recent_movements))
            // Stocks
            .service(
                web::scope("/stocks")
                    .route("/{id}", web::get().to(placement_handlers::get_stock))
                    .route("/{id}/move", web::patch().to(placement_handlers::move_stock))
                    .route("/{id}/history", web::get().to(placement_handlers::get_stock_history)),
            )
            // Topology
            .service(
                web::scope("/nodes")
                    .route("", web::get().to(node_handlers::get_all_nodes))
                    .route("", web::post().to(node_handlers::create_node))
                    .route("/{id}", web::get().to(node_handlers::get_node))
                    .route("/{id}/limits", web::patch().to(node_handlers::resize_node))
                    .route("/{id}/active", web::patch().to(node_handlers::set_node_active)),
            )
            .route("/ledger/verify", web::get().to(node_handlers::verify_ledger)),
    );
}

/// Health check and metrics (no actor required)
pub fn configure_health(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/health")
            .route("", web::get().to(monitoring::health_check))
            .route("/ready", web::get().to(monitoring::readiness_check))
            .route("/metrics", web::get().to(monitoring::metrics_endpoint)),
    );
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("Failed to load configuration")?;

    setup_logging(&config)?;
    config.print_startup_info();

    if config.is_production() {
        validate_production_config(&config)?;
    }

    setup_database(&config.database.url).await?;
    let pool = create_database_pool(&config.database).await?;

    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    log::info!("✅ Database migrations completed");

    let metrics_arc = Arc::new(Metrics::new());
    let repo = Arc::new(SqlitePlacementRepository::new(pool.clone()));
    let engine = Arc::new(PlacementEngine::new(
        repo,
        metrics_arc.clone(),
        config.ledger.lock_timeout(),
    ));

    let report = engine
        .bootstrap()
        .await
        .context("Failed to load the capacity ledger")?;
    if !report.drift.is_empty() && config.ledger.fail_on_drift {
        anyhow::bail!(
            "Stored counters disagree with stock rows on {} nodes (ledger.fail_on_drift is set)",
            report.drift.len()
        );
    }

    start_maintenance_tasks(pool.clone(), engine.clone(), config.ledger.clone()).await;

    let app_state = Arc::new(AppState {
        db_pool: pool.clone(),
        config,
        engine: engine.clone(),
    });

    let server_config = app_state.config.server.clone();
    let bind_address = format!("{}:{}", server_config.host, server_config.port);
    log::info!("🚀 Starting server at http://{}", bind_address);

    let mut server = HttpServer::new(move || {
        let config = &app_state.config;
        let cors = setup_cors(&config.security.allowed_origins, config.is_production());
        let security_headers = setup_security_headers(&config.security);

        App::new()
            .wrap(cors)
            .wrap(security_headers)
            .wrap(Logger::default())
            .wrap(Compress::default())
            .wrap(RequestLogger::new(metrics_arc.clone()))
            .app_data(web::JsonConfig::default().limit(config.security.max_request_size))
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::Data::new(metrics_arc.clone()))
            .app_data(web::Data::new(app_state.db_pool.clone()))
            .app_data(web::Data::new(app_state.engine.clone()))
            .configure(configure_health)
            .configure(configure_api)
    })
    .keep_alive(Duration::from_secs(server_config.keep_alive))
    .client_request_timeout(Duration::from_secs(server_config.client_timeout))
    .client_disconnect_timeout(Duration::from_secs(server_config.client_shutdown));

    if let Some(workers) = server_config.workers {
        server = server.workers(workers);
    }

    server
        .bind(&bind_address)?
        .run()
        .await
        .context("Server failed to run")?;

    log::info!("👋 Server stopped");
    Ok(())
}

// ==================== HELPER FUNCTIONS ====================

fn setup_cors(allowed_origins: &[String], is_production: bool) -> Cors {
    let mut cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "PATCH", "OPTIONS"])
        .allowed_headers(vec![header::CONTENT_TYPE, header::ACCEPT])
        .allowed_header("X-User-Id")
        .allowed_header("X-User-Capabilities")
        .allowed_header(placement_handlers::IDEMPOTENCY_HEADER)
        .expose_headers(vec![header::CONTENT_LENGTH])
        .max_age(3600);

    if allowed_origins.iter().any(|o| o == "*") && !is_production {
        log::warn!("⚠️  Using wildcard CORS (*) in development mode");
        return cors.allow_any_origin();
    }

    for origin in allowed_origins.iter().filter(|o| !o.is_empty() && *o != "*") {
        cors = cors.allowed_origin(origin);
    }
    cors
}

fn setup_logging(config: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    let layer = tracing_subscriber::fmt::layer().with_target(config.logging.with_target);

    if config.logging.format == "compact" {
        registry.with(layer.compact()).try_init()?;
    } else {
        registry.with(layer).try_init()?;
    }

    Ok(())
}

fn validate_production_config(config: &Config) -> anyhow::Result<()> {
    if config.security.allowed_origins.iter().any(|o| o == "*") {
        anyhow::bail!("Wildcard CORS origins not allowed in production!");
    }

    if config.database.url.contains(":memory:") {
        anyhow::bail!("In-memory database is not allowed in production!");
    }

    Ok(())
}

async fn setup_database(database_url: &str) -> anyhow::Result<()> {
    if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
        log::info!("Creating database: {}", database_url);
        Sqlite::create_database(database_url).await?;
    }
    Ok(())
}

async fn create_database_pool(db_config: &config::DatabaseConfig) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&db_config.url)
        .with_context(|| format!("Invalid database url: {}", db_config.url))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(db_config.busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(db_config.max_connections)
        .min_connections(db_config.min_connections)
        .acquire_timeout(Duration::from_secs(db_config.connect_timeout))
        .idle_timeout(Duration::from_secs(db_config.idle_timeout))
        .connect_with(options)
        .await?;
    Ok(pool)
}

fn setup_security_headers(config: &config::SecurityConfig) -> DefaultHeaders {
    let mut headers = DefaultHeaders::new()
        .add(("X-Content-Type-Options", "nosniff"))
        .add(("X-Frame-Options", "DENY"))
        .add(("Referrer-Policy", "strict-origin-when-cross-origin"));

    if config.require_https {
        headers = headers.add((
            "Strict-Transport-Security",
            "max-age=31536000; includeSubDomains; preload",
        ));
    }

    headers
}
