// src/error.rs
//! Ошибки ядра (PlacementError) и HTTP-слоя (ApiError)

use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use std::fmt;

use crate::actor::Capability;
use crate::models::NodeKind;

// ==================== CORE ERRORS ====================

/// Which capacity dimension ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityDimension {
    Weight,
    Count,
}

impl fmt::Display for CapacityDimension {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CapacityDimension::Weight => write!(f, "weight"),
            CapacityDimension::Count => write!(f, "count"),
        }
    }
}

#[derive(Debug)]
pub enum PlacementError {
    CapacityExceeded {
        node_id: String,
        kind: NodeKind,
        dimension: CapacityDimension,
        requested: f64,
        available: f64,
    },
    SlotInactive(String),
    SlotOccupied(String),
    StockAlreadyIssued(String),
    StockNotFound(String),
    NodeNotFound(String),
    InvalidLocation(String),
    SameLocation(String),
    InvalidRequest(String),
    NotPermitted(Capability),
    LockTimeout(String),
    /// Гонка с параллельной записью; повтор с тем же operation id безопасен
    Conflict(String),
    /// Operation id already belongs to a different operation kind or stock.
    OperationReused(String),
    NodeExists(String),
    Database(sqlx::Error),
    Internal(String),
}

pub type PlacementResult<T> = Result<T, PlacementError>;

impl PlacementError {
    /// Стабильный код ошибки для клиентов
    pub fn code(&self) -> &'static str {
        match self {
            PlacementError::CapacityExceeded { .. } => "CapacityExceeded",
            PlacementError::SlotInactive(_) => "SlotInactive",
            PlacementError::SlotOccupied(_) => "SlotOccupied",
            PlacementError::StockAlreadyIssued(_) => "StockAlreadyIssued",
            PlacementError::StockNotFound(_) => "StockNotFound",
            PlacementError::NodeNotFound(_) => "NodeNotFound",
            PlacementError::InvalidLocation(_) => "InvalidLocation",
            PlacementError::SameLocation(_) => "SameLocation",
            PlacementError::InvalidRequest(_) => "InvalidRequest",
            PlacementError::NotPermitted(_) => "NotPermitted",
            PlacementError::LockTimeout(_) => "LockTimeout",
            PlacementError::Conflict(_) => "Conflict",
            PlacementError::OperationReused(_) => "OperationReused",
            PlacementError::NodeExists(_) => "NodeExists",
            PlacementError::Database(_) => "DatabaseError",
            PlacementError::Internal(_) => "InternalError",
        }
    }

    /// Transient failures are safe to retry with the same operation id.
    pub fn is_transient(&self) -> bool {
        matches!(self, PlacementError::LockTimeout(_) | PlacementError::Conflict(_))
    }

    pub fn capacity_exceeded(
        node_id: &str,
        kind: NodeKind,
        dimension: CapacityDimension,
        requested: f64,
        available: f64,
    ) -> Self {
        PlacementError::CapacityExceeded {
            node_id: node_id.to_string(),
            kind,
            dimension,
            requested,
            available: available.max(0.0),
        }
    }
}

impl fmt::Display for PlacementError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PlacementError::CapacityExceeded { node_id, kind, dimension, requested, available } => write!(
                f,
                "Capacity exceeded at {} '{}': requested {} {:.3}, available {:.3}",
                kind, node_id, dimension, requested, available
            ),
            PlacementError::SlotInactive(id) => write!(f, "Rack level slot '{}' is inactive", id),
            PlacementError::SlotOccupied(id) => write!(f, "Rack level slot '{}' is already occupied", id),
            PlacementError::StockAlreadyIssued(id) => write!(f, "Stock '{}' has already been issued", id),
            PlacementError::StockNotFound(id) => write!(f, "Stock with ID '{}' not found", id),
            PlacementError::NodeNotFound(id) => write!(f, "Node with ID '{}' not found", id),
            PlacementError::InvalidLocation(msg) => write!(f, "Invalid location: {}", msg),
            PlacementError::SameLocation(id) => write!(f, "Stock is already located in '{}'", id),
            PlacementError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            PlacementError::NotPermitted(cap) => write!(f, "Capability '{}' is required", cap),
            PlacementError::LockTimeout(key) => write!(f, "Timed out waiting for lock on '{}'", key),
            PlacementError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            PlacementError::OperationReused(msg) => write!(f, "Operation id reused: {}", msg),
            PlacementError::NodeExists(id) => write!(f, "Node with ID '{}' already exists", id),
            PlacementError::Database(err) => write!(f, "Database error: {}", err),
            PlacementError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for PlacementError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlacementError::Database(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for PlacementError {
    fn from(err: sqlx::Error) -> Self {
        // SQLITE_BUSY (5) / SQLITE_LOCKED (6): конкурентная запись, можно повторить
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return PlacementError::Conflict(db_err.message().to_string());
            }
            if matches!(db_err.code().as_deref(), Some("5") | Some("6")) {
                return PlacementError::Conflict(format!("storage busy: {}", db_err.message()));
            }
        }
        PlacementError::Database(err)
    }
}

// ==================== API ERRORS ====================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    ValidationError(String),
    Placement(PlacementError),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    code: &'static str,
    message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            ApiError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            ApiError::ValidationError(msg) => write!(f, "Validation Error: {}", msg),
            ApiError::Placement(err) => write!(f, "{}", err),
        }
    }
}

impl ApiError {
    pub fn bad_request(msg: &str) -> Self {
        ApiError::BadRequest(msg.to_string())
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Unauthorized(_) => "Unauthorized",
            ApiError::ValidationError(_) => "ValidationError",
            ApiError::Placement(err) => err.code(),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            ApiError::BadRequest(_) | ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Placement(err) => match err {
                PlacementError::CapacityExceeded { .. }
                | PlacementError::SlotInactive(_)
                | PlacementError::SlotOccupied(_)
                | PlacementError::Conflict(_)
                | PlacementError::OperationReused(_)
                | PlacementError::NodeExists(_) => StatusCode::CONFLICT,
                PlacementError::InvalidLocation(_)
                | PlacementError::SameLocation(_)
                | PlacementError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                PlacementError::StockAlreadyIssued(_) => StatusCode::GONE,
                PlacementError::StockNotFound(_) | PlacementError::NodeNotFound(_) => StatusCode::NOT_FOUND,
                PlacementError::NotPermitted(_) => StatusCode::FORBIDDEN,
                PlacementError::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
                PlacementError::Database(_) | PlacementError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Детали БД наружу не отдаём
        let message = match self {
            ApiError::Placement(PlacementError::Database(_)) => "Database error".to_string(),
            _ => self.to_string(),
        };

        HttpResponse::build(self.status_code()).json(ErrorResponse {
            success: false,
            code: self.code(),
            message,
        })
    }
}

impl From<PlacementError> for ApiError {
    fn from(err: PlacementError) -> Self {
        ApiError::Placement(err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Placement(PlacementError::from(err))
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::ValidationError(err.to_string())
    }
}
