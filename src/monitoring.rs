// src/monitoring.rs
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;
use tokio::time::{interval, sleep, Duration};

use crate::config::LedgerConfig;
use crate::placement::PlacementEngine;

const CLEANUP_CHUNK: i64 = 1000;

#[derive(Debug, Clone)]
pub struct Metrics {
    pub request_count: Arc<AtomicU64>,
    pub error_count: Arc<AtomicU64>,
    pub placements_committed: Arc<AtomicU64>,
    pub placements_rejected: Arc<AtomicU64>,
    pub placements_replayed: Arc<AtomicU64>,
    pub response_times: Arc<std::sync::Mutex<Vec<u64>>>,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            request_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
            placements_committed: Arc::new(AtomicU64::new(0)),
            placements_rejected: Arc::new(AtomicU64::new(0)),
            placements_replayed: Arc::new(AtomicU64::new(0)),
            response_times: Arc::new(std::sync::Mutex::new(Vec::new())),
            started_at: Instant::now(),
        }
    }

    pub fn increment_requests(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_errors(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_placements_committed(&self) {
        self.placements_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_placements_rejected(&self) {
        self.placements_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_placements_replayed(&self) {
        self.placements_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_time(&self, time_ms: u64) {
        if let Ok(mut times) = self.response_times.lock() {
            times.push(time_ms);
            if times.len() > 1000 {
                times.remove(0);
            }
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn avg_response_time_ms(&self) -> f64 {
        match self.response_times.lock() {
            Ok(times) if !times.is_empty() => times.iter().sum::<u64>() as f64 / times.len() as f64,
            _ => 0.0,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub requests_total: u64,
    pub errors_total: u64,
    pub placements_committed: u64,
    pub placements_rejected: u64,
    pub placements_replayed: u64,
    pub avg_response_time_ms: f64,
    pub database_connections: u32,
    pub ledger_nodes: usize,
}

pub async fn health_check(metrics: web::Data<Arc<Metrics>>) -> HttpResponse {
    let response = HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: metrics.uptime_seconds(),
    };

    HttpResponse::Ok().json(response)
}

pub async fn readiness_check(pool: web::Data<SqlitePool>) -> HttpResponse {
    match sqlx::query("SELECT 1").fetch_one(pool.get_ref()).await {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ready",
            "database": "connected"
        })),
        Err(_) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "not ready",
            "database": "disconnected"
        })),
    }
}

pub async fn metrics_endpoint(
    metrics: web::Data<Arc<Metrics>>,
    pool: web::Data<SqlitePool>,
    engine: web::Data<Arc<PlacementEngine>>,
) -> HttpResponse {
    let response = MetricsResponse {
        requests_total: metrics.request_count.load(Ordering::Relaxed),
        errors_total: metrics.error_count.load(Ordering::Relaxed),
        placements_committed: metrics.placements_committed.load(Ordering::Relaxed),
        placements_rejected: metrics.placements_rejected.load(Ordering::Relaxed),
        placements_replayed: metrics.placements_replayed.load(Ordering::Relaxed),
        avg_response_time_ms: metrics.avg_response_time_ms(),
        database_connections: pool.size(),
        ledger_nodes: engine.ledger().len().await,
    };

    HttpResponse::Ok().json(response)
}

// ==================== REQUEST METRICS MIDDLEWARE ====================

pub struct RequestLogger {
    metrics: Arc<Metrics>,
}

impl RequestLogger {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl<S, B> actix_web::dev::Transform<S, actix_web::dev::ServiceRequest> for RequestLogger
where
    S: actix_web::dev::Service<
        actix_web::dev::ServiceRequest,
        Response = actix_web::dev::ServiceResponse<B>,
        Error = actix_web::Error,
    >,
    S::Future: 'static,
    B: 'static,
{
    type Response = actix_web::dev::ServiceResponse<B>;
    type Error = actix_web::Error;
    type InitError = ();
    type Transform = RequestLoggerMiddleware<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(RequestLoggerMiddleware {
            service,
            metrics: self.metrics.clone(),
        }))
    }
}

pub struct RequestLoggerMiddleware<S> {
    service: S,
    metrics: Arc<Metrics>,
}

impl<S, B> actix_web::dev::Service<actix_web::dev::ServiceRequest> for RequestLoggerMiddleware<S>
where
    S: actix_web::dev::Service<
        actix_web::dev::ServiceRequest,
        Response = actix_web::dev::ServiceResponse<B>,
        Error = actix_web::Error,
    >,
    S::Future: 'static,
    B: 'static,
{
    type Response = actix_web::dev::ServiceResponse<B>;
    type Error = actix_web::Error;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, ctx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: actix_web::dev::ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let metrics = self.metrics.clone();
        let fut = self.service.call(req);

        Box::pin(async move {
            metrics.increment_requests();
            let res = fut.await;
            metrics.record_response_time(start_time.elapsed().as_millis() as u64);

            if let Ok(ref response) = res {
                if response.status().is_client_error() || response.status().is_server_error() {
                    metrics.increment_errors();
                }
            }
            res
        })
    }
}

// ==================== MAINTENANCE ====================

pub async fn start_maintenance_tasks(pool: SqlitePool, engine: Arc<PlacementEngine>, config: LedgerConfig) {
    if config.verify_interval_seconds > 0 {
        let period = Duration::from_secs(config.verify_interval_seconds);
        tokio::spawn(async move {
            verify_ledger_periodically(engine, period).await;
        });
    }

    if config.operation_retention_days > 0 {
        let retention_days = config.operation_retention_days;
        tokio::spawn(async move {
            cleanup_old_operations(pool, retention_days).await;
        });
    }
}

async fn verify_ledger_periodically(engine: Arc<PlacementEngine>, period: Duration) {
    let mut interval = interval(period);
    interval.tick().await; // первый тик мгновенный, сразу после загрузки проверять нечего

    loop {
        interval.tick().await;
        match engine.verify().await {
            Ok(report) if report.healthy => {
                log::debug!("Ledger verified: {} nodes consistent", report.nodes_checked);
            }
            Ok(report) => {
                for violation in &report.violations {
                    log::error!("❌ Ledger invariant violated: {}", violation);
                }
            }
            Err(e) => log::warn!("Ledger verification skipped: {}", e),
        }
    }
}

async fn cleanup_old_operations(pool: SqlitePool, retention_days: i64) {
    let mut interval = interval(Duration::from_secs(24 * 3600)); // Раз в день

    loop {
        interval.tick().await;
        log::info!("Starting daily cleanup of idempotency records...");
        match purge_expired_operations(&pool, retention_days).await {
            Ok(0) => {}
            Ok(total) => log::info!("Cleaned up {} old idempotency records in chunks", total),
            Err(e) => log::error!("Failed to cleanup idempotency records: {}", e),
        }
    }
}

/// Deletes idempotency records older than the retention window, in chunks.
pub async fn purge_expired_operations(pool: &SqlitePool, retention_days: i64) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days);
    let mut total_deleted = 0;

    loop {
        // Удаляем пачками по 1000
        let result = sqlx::query(
            "DELETE FROM placement_operations
             WHERE operation_id IN (
                 SELECT operation_id FROM placement_operations
                 WHERE created_at < ?
                 LIMIT ?
             )",
        )
        .bind(cutoff)
        .bind(CLEANUP_CHUNK)
        .execute(pool)
        .await?;

        let count = result.rows_affected();
        total_deleted += count;
        if count < CLEANUP_CHUNK as u64 {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    Ok(total_deleted)
}
