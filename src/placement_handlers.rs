// src/placement_handlers.rs
//! Обработчики приёмки, перемещения и выдачи стоков
//!
//! Endpoints:
//!   POST   /api/v1/receptions                - приёмка нового стока
//!   PATCH  /api/v1/stocks/{id}/move           - перемещение стока
//!   POST   /api/v1/issues                     - выдача стока
//!   GET    /api/v1/stocks/{id}                - сток
//!   GET    /api/v1/stocks/{id}/history        - история перемещений стока
//!   GET    /api/v1/movements?limit=           - последние перемещения

use actix_web::{web, HttpRequest, HttpResponse};
use log::info;
use std::sync::Arc;
use validator::Validate;

use crate::actor::ActorContext;
use crate::error::{ApiError, ApiResult};
use crate::handlers::ApiResponse;
use crate::models::{CreateReceptionRequest, IssueStockRequest, MovementQuery, MoveStockRequest};
use crate::AppState;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Operation id from the body, or from the `Idempotency-Key` header. When both
/// are present they must agree.
fn operation_id(body: Option<&str>, http_request: &HttpRequest) -> ApiResult<Option<String>> {
    let header = http_request
        .headers()
        .get(IDEMPOTENCY_HEADER)
        .map(|v| {
            v.to_str()
                .map(|s| s.trim().to_string())
                .map_err(|_| ApiError::bad_request("Idempotency-Key must be visible ASCII"))
        })
        .transpose()?
        .filter(|s| !s.is_empty());

    match (body, header) {
        (Some(b), Some(h)) if b != h => Err(ApiError::bad_request(
            "operation_id and Idempotency-Key header disagree",
        )),
        (Some(b), _) => Ok(Some(b.to_string())),
        (None, Some(h)) if h.len() > 128 => Err(ApiError::bad_request("Idempotency-Key is too long")),
        (None, h) => Ok(h),
    }
}

// ==================== RECEPTION ====================

pub async fn create_reception(
    app_state: web::Data<Arc<AppState>>,
    actor: ActorContext,
    request: web::Json<CreateReceptionRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    request.validate()?;
    let mut request = request.into_inner();
    request.operation_id = operation_id(request.operation_id.as_deref(), &http_request)?;

    let outcome = app_state.engine.reception(&actor, &request).await?;
    info!("📥 Reception: stock {} ({} kg) by {}", outcome.stock_id, request.weight, actor.user_id);

    let response = if outcome.replayed {
        HttpResponse::Ok().json(ApiResponse::success_with_message(
            outcome,
            "Operation already applied".to_string(),
        ))
    } else {
        HttpResponse::Created().json(ApiResponse::success(outcome))
    };
    Ok(response)
}

// ==================== MOVE ====================

pub async fn move_stock(
    app_state: web::Data<Arc<AppState>>,
    actor: ActorContext,
    path: web::Path<String>,
    request: web::Json<MoveStockRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let stock_id = path.into_inner();
    request.validate()?;
    let operation_id = operation_id(request.operation_id.as_deref(), &http_request)?;

    let outcome = app_state
        .engine
        .move_stock(&actor, &stock_id, &request.destination, operation_id.as_deref())
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::success(outcome)))
}

// ==================== ISSUE ====================

pub async fn issue_stock(
    app_state: web::Data<Arc<AppState>>,
    actor: ActorContext,
    request: web::Json<IssueStockRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    request.validate()?;
    let operation_id = operation_id(request.operation_id.as_deref(), &http_request)?;

    let outcome = app_state
        .engine
        .issue(&actor, &request.stock_id, operation_id.as_deref())
        .await?;
    info!("📤 Issue: stock {} by {}", outcome.stock_id, actor.user_id);

    Ok(HttpResponse::Ok().json(ApiResponse::success(outcome)))
}

// ==================== READS ====================

pub async fn get_stock(
    app_state: web::Data<Arc<AppState>>,
    _actor: ActorContext,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let stock = app_state.engine.get_stock(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(stock)))
}

pub async fn get_stock_history(
    app_state: web::Data<Arc<AppState>>,
    _actor: ActorContext,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let history = app_state.engine.stock_history(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(history)))
}

pub async fn get_recent_movements(
    app_state: web::Data<Arc<AppState>>,
    _actor: ActorContext,
    query: web::Query<MovementQuery>,
) -> ApiResult<HttpResponse> {
    let movements = app_state.engine.recent_movements(query.normalize()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(movements)))
}
