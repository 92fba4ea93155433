// src/models/movement.rs
//! Записи журнала перемещений (история стока) и идемпотентности

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};

use super::stock::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MovementKind {
    Reception,
    Move,
    Issue,
}

/// Append-only; never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MovementRecord {
    pub id: String,
    pub operation_id: Option<String>,
    pub kind: MovementKind,
    pub stock_id: String,
    pub actor_user_id: String,
    pub moved_at: DateTime<Utc>,
    pub from_location: Option<Location>,
    pub to_location: Option<Location>,
    pub reception_id: Option<String>,
    pub issue_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct MovementRow {
    pub id: String,
    pub operation_id: Option<String>,
    pub kind: String,
    pub stock_id: String,
    pub actor_user_id: String,
    pub moved_at: DateTime<Utc>,
    pub from_waiting_room_id: Option<String>,
    pub from_rack_level_slot_id: Option<String>,
    pub to_waiting_room_id: Option<String>,
    pub to_rack_level_slot_id: Option<String>,
    pub reception_id: Option<String>,
    pub issue_id: Option<String>,
}

impl TryFrom<MovementRow> for MovementRecord {
    type Error = String;

    fn try_from(row: MovementRow) -> Result<Self, Self::Error> {
        let kind = MovementKind::from_str(&row.kind)
            .map_err(|_| format!("Unknown movement kind '{}'", row.kind))?;
        Ok(MovementRecord {
            from_location: Location::from_columns(row.from_waiting_room_id, row.from_rack_level_slot_id)?,
            to_location: Location::from_columns(row.to_waiting_room_id, row.to_rack_level_slot_id)?,
            id: row.id,
            operation_id: row.operation_id,
            kind,
            stock_id: row.stock_id,
            actor_user_id: row.actor_user_id,
            moved_at: row.moved_at,
            reception_id: row.reception_id,
            issue_id: row.issue_id,
        })
    }
}

// ==================== DOCUMENTS ====================

/// Документ приёмки: создание стока
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceptionRecord {
    pub id: String,
    pub stock_id: String,
    pub product_id: String,
    pub product_count: i64,
    pub weight: f64,
    pub destination: Location,
    pub actor_user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Документ выдачи: завершение жизни стока
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueRecord {
    pub id: String,
    pub stock_id: String,
    pub from_location: Location,
    pub actor_user_id: String,
    pub created_at: DateTime<Utc>,
}

// ==================== IDEMPOTENCY ====================

/// Result of a committed operation, replayed for a retried operation id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationRecord {
    pub operation_id: String,
    pub kind: MovementKind,
    pub stock_id: String,
    pub movement_id: String,
    pub reception_id: Option<String>,
    pub issue_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct OperationRow {
    pub operation_id: String,
    pub kind: String,
    pub stock_id: String,
    pub movement_id: String,
    pub reception_id: Option<String>,
    pub issue_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<OperationRow> for OperationRecord {
    type Error = String;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let kind = MovementKind::from_str(&row.kind)
            .map_err(|_| format!("Unknown operation kind '{}'", row.kind))?;
        Ok(OperationRecord {
            operation_id: row.operation_id,
            kind,
            stock_id: row.stock_id,
            movement_id: row.movement_id,
            reception_id: row.reception_id,
            issue_id: row.issue_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct MovementQuery {
    pub limit: Option<i64>,
}

impl MovementQuery {
    pub fn normalize(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}
