// src/models/stock.rs
//! Сток (одна физическая партия товара) и его местоположение

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::node::NodeKind;

// ==================== LOCATION ====================

/// Where a stock physically sits. A stock is in exactly one leaf or nowhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Location {
    WaitingRoom(String),
    RackLevelSlot(String),
}

impl Location {
    pub fn node_id(&self) -> &str {
        match self {
            Location::WaitingRoom(id) | Location::RackLevelSlot(id) => id,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Location::WaitingRoom(_) => NodeKind::WaitingRoom,
            Location::RackLevelSlot(_) => NodeKind::RackLevelSlot,
        }
    }

    /// Колонки (waiting_room_id, rack_level_slot_id) для таблицы stocks
    pub fn to_columns(location: Option<&Location>) -> (Option<String>, Option<String>) {
        match location {
            Some(Location::WaitingRoom(id)) => (Some(id.clone()), None),
            Some(Location::RackLevelSlot(id)) => (None, Some(id.clone())),
            None => (None, None),
        }
    }

    pub fn from_columns(
        waiting_room_id: Option<String>,
        rack_level_slot_id: Option<String>,
    ) -> Result<Option<Location>, String> {
        match (waiting_room_id, rack_level_slot_id) {
            (Some(room), None) => Ok(Some(Location::WaitingRoom(room))),
            (None, Some(slot)) => Ok(Some(Location::RackLevelSlot(slot))),
            (None, None) => Ok(None),
            (Some(room), Some(slot)) => Err(format!(
                "stock located in both waiting room '{}' and slot '{}'",
                room, slot
            )),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.node_id())
    }
}

// ==================== STOCK ====================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stock {
    pub id: String,
    pub product_id: String,
    pub weight: f64,
    pub product_count: i64,
    pub location: Option<Location>,
    pub is_issued: bool,
    pub reception_id: String,
    pub issue_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct StockRow {
    pub id: String,
    pub product_id: String,
    pub weight: f64,
    pub product_count: i64,
    pub waiting_room_id: Option<String>,
    pub rack_level_slot_id: Option<String>,
    pub is_issued: bool,
    pub reception_id: String,
    pub issue_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<StockRow> for Stock {
    type Error = String;

    fn try_from(row: StockRow) -> Result<Self, Self::Error> {
        let location = Location::from_columns(row.waiting_room_id, row.rack_level_slot_id)
            .map_err(|e| format!("Stock {}: {}", row.id, e))?;
        Ok(Stock {
            id: row.id,
            product_id: row.product_id,
            weight: row.weight,
            product_count: row.product_count,
            location,
            is_issued: row.is_issued,
            reception_id: row.reception_id,
            issue_id: row.issue_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ==================== REQUESTS ====================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateReceptionRequest {
    #[validate(length(min = 1, max = 100, message = "product_id must be 1-100 characters"))]
    pub product_id: String,

    #[serde(alias = "product_count")]
    #[validate(range(min = 1, message = "count must be positive"))]
    pub count: i64,

    #[validate(range(min = 0.001, message = "weight must be positive"))]
    pub weight: f64,

    pub destination: Location,

    #[validate(length(min = 1, max = 128, message = "operation_id must be 1-128 characters"))]
    pub operation_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MoveStockRequest {
    pub destination: Location,

    #[validate(length(min = 1, max = 128, message = "operation_id must be 1-128 characters"))]
    pub operation_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct IssueStockRequest {
    #[validate(length(min = 1, max = 64, message = "stock_id is required"))]
    pub stock_id: String,

    #[validate(length(min = 1, max = 128, message = "operation_id must be 1-128 characters"))]
    pub operation_id: Option<String>,
}
