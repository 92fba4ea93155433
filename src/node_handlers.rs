// src/node_handlers.rs
//! Обработчики топологии склада: узлы, лимиты, активность слотов, проверка ledger

use actix_web::{web, HttpResponse};
use log::{info, warn};
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

use crate::actor::ActorContext;
use crate::error::ApiResult;
use crate::handlers::ApiResponse;
use crate::models::{CreateNodeRequest, NodeKind, ResizeNodeRequest, SetSlotActiveRequest};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct NodeListQuery {
    pub kind: Option<NodeKind>,
    pub parent_id: Option<String>,
}

// ==================== GET ALL NODES ====================

pub async fn get_all_nodes(
    app_state: web::Data<Arc<AppState>>,
    _actor: ActorContext,
    query: web::Query<NodeListQuery>,
) -> ApiResult<HttpResponse> {
    let nodes: Vec<_> = app_state
        .engine
        .all_snapshots()
        .await?
        .into_iter()
        .filter(|n| query.kind.map_or(true, |k| n.kind == k))
        .filter(|n| {
            query
                .parent_id
                .as_deref()
                .map_or(true, |p| n.parent_id.as_deref() == Some(p))
        })
        .collect();

    Ok(HttpResponse::Ok().json(ApiResponse::success(nodes)))
}

// ==================== GET NODE ====================

pub async fn get_node(
    app_state: web::Data<Arc<AppState>>,
    _actor: ActorContext,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let snapshot = app_state.engine.node_snapshot(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(snapshot)))
}

// ==================== CREATE NODE ====================

pub async fn create_node(
    app_state: web::Data<Arc<AppState>>,
    actor: ActorContext,
    request: web::Json<CreateNodeRequest>,
) -> ApiResult<HttpResponse> {
    request.validate()?;

    let snapshot = app_state.engine.create_node(&actor, &request).await?;
    Ok(HttpResponse::Created().json(ApiResponse::success_with_message(
        snapshot,
        "Node created successfully".to_string(),
    )))
}

// ==================== LIMITS & ACTIVITY ====================

pub async fn resize_node(
    app_state: web::Data<Arc<AppState>>,
    actor: ActorContext,
    path: web::Path<String>,
    request: web::Json<ResizeNodeRequest>,
) -> ApiResult<HttpResponse> {
    request.validate()?;
    let node_id = path.into_inner();

    let snapshot = app_state.engine.resize_node(&actor, &node_id, &request).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(snapshot)))
}

pub async fn set_node_active(
    app_state: web::Data<Arc<AppState>>,
    actor: ActorContext,
    path: web::Path<String>,
    request: web::Json<SetSlotActiveRequest>,
) -> ApiResult<HttpResponse> {
    let slot_id = path.into_inner();

    let snapshot = app_state
        .engine
        .set_slot_active(&actor, &slot_id, request.is_active)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(snapshot)))
}

// ==================== VERIFY ====================

pub async fn verify_ledger(
    app_state: web::Data<Arc<AppState>>,
    actor: ActorContext,
) -> ApiResult<HttpResponse> {
    let report = app_state.engine.verify().await?;

    if report.healthy {
        info!("✅ Ledger verified by {}: {} nodes consistent", actor.user_id, report.nodes_checked);
    } else {
        warn!("⚠️ Ledger verification by {} found {} violations", actor.user_id, report.violations.len());
    }

    Ok(HttpResponse::Ok().json(ApiResponse::success(report)))
}
