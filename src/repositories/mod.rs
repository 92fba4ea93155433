// src/repositories/mod.rs
//! Хранилище узлов, стоков и журнала размещений

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

use crate::audit;
use crate::error::{PlacementError, PlacementResult};
use crate::ledger::NodePath;
use crate::models::{
    CapacityNode, IssueRecord, Location, MovementKind, MovementRecord, NodeRow, OperationRecord,
    OperationRow, ReceptionRecord, Stock, StockRow,
};

/// Everything one committed placement writes, applied in a single transaction.
#[derive(Debug, Clone)]
pub struct PlacementWrite {
    pub operation: Option<OperationRecord>,
    /// State of the stock after the operation.
    pub stock: Stock,
    pub reception: Option<ReceptionRecord>,
    pub issue: Option<IssueRecord>,
    pub source_path: Option<NodePath>,
    pub destination_path: Option<NodePath>,
    pub movement: MovementRecord,
}

#[async_trait]
pub trait PlacementRepository: Send + Sync {
    async fn load_nodes(&self) -> PlacementResult<Vec<CapacityNode>>;

    /// Stocks that still occupy a location.
    async fn load_live_stocks(&self) -> PlacementResult<Vec<Stock>>;

    async fn get_stock(&self, id: &str) -> PlacementResult<Option<Stock>>;

    async fn find_operation(&self, operation_id: &str) -> PlacementResult<Option<OperationRecord>>;

    /// Inserts the node and bumps the parent's child count where the parent
    /// counts children.
    async fn insert_node(&self, node: &CapacityNode) -> PlacementResult<()>;

    async fn update_node_limits(&self, id: &str, max_weight: f64, max_count: i64) -> PlacementResult<()>;

    async fn set_slot_active(&self, id: &str, active: bool) -> PlacementResult<()>;

    /// Write-ahead half of a placement: stock row, documents, node counters,
    /// movement record and idempotency key, all or nothing.
    async fn commit_placement(&self, write: &PlacementWrite) -> PlacementResult<()>;

    async fn stock_history(&self, stock_id: &str) -> PlacementResult<Vec<MovementRecord>>;

    async fn recent_movements(&self, limit: i64) -> PlacementResult<Vec<MovementRecord>>;
}

// ==================== SQLITE ====================

#[derive(Clone)]
pub struct SqlitePlacementRepository {
    pool: SqlitePool,
}

const NODE_COLUMNS: &str = "id, kind, parent_id, code, max_weight, max_count, occupied_weight, \
     occupied_count, is_active, created_at, updated_at";

const STOCK_COLUMNS: &str = "id, product_id, weight, product_count, waiting_room_id, rack_level_slot_id, \
     is_issued, reception_id, issue_id, created_at, updated_at";

impl SqlitePlacementRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlacementRepository for SqlitePlacementRepository {
    async fn load_nodes(&self) -> PlacementResult<Vec<CapacityNode>> {
        let query = format!("SELECT {} FROM nodes ORDER BY id", NODE_COLUMNS);
        let rows: Vec<NodeRow> = sqlx::query_as(&query).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| CapacityNode::try_from(row).map_err(PlacementError::Internal))
            .collect()
    }

    async fn load_live_stocks(&self) -> PlacementResult<Vec<Stock>> {
        let query = format!("SELECT {} FROM stocks WHERE is_issued = 0", STOCK_COLUMNS);
        let rows: Vec<StockRow> = sqlx::query_as(&query).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| Stock::try_from(row).map_err(PlacementError::Internal))
            .collect()
    }

    async fn get_stock(&self, id: &str) -> PlacementResult<Option<Stock>> {
        let query = format!("SELECT {} FROM stocks WHERE id = ?", STOCK_COLUMNS);
        let row: Option<StockRow> = sqlx::query_as(&query).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| Stock::try_from(r).map_err(PlacementError::Internal))
            .transpose()
    }

    async fn find_operation(&self, operation_id: &str) -> PlacementResult<Option<OperationRecord>> {
        let row: Option<OperationRow> = sqlx::query_as(
            r#"SELECT operation_id, kind, stock_id, movement_id, reception_id, issue_id, created_at
               FROM placement_operations WHERE operation_id = ?"#,
        )
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| OperationRecord::try_from(r).map_err(PlacementError::Internal))
            .transpose()
    }

    async fn insert_node(&self, node: &CapacityNode) -> PlacementResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO nodes
               (id, kind, parent_id, code, max_weight, max_count, occupied_weight, occupied_count,
                is_active, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, 0.0, 0, ?, ?, ?)"#,
        )
        .bind(&node.id)
        .bind(node.kind.as_ref())
        .bind(&node.parent_id)
        .bind(&node.code)
        .bind(node.max_weight)
        .bind(node.max_count)
        .bind(node.is_active)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if let Some(parent_id) = &node.parent_id {
            sqlx::query(
                r#"UPDATE nodes SET occupied_count = occupied_count + 1, updated_at = ?
                   WHERE id = ? AND kind IN ('warehouse', 'section', 'rack')"#,
            )
            .bind(now)
            .bind(parent_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_node_limits(&self, id: &str, max_weight: f64, max_count: i64) -> PlacementResult<()> {
        let result = sqlx::query("UPDATE nodes SET max_weight = ?, max_count = ?, updated_at = ? WHERE id = ?")
            .bind(max_weight)
            .bind(max_count)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PlacementError::NodeNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_slot_active(&self, id: &str, active: bool) -> PlacementResult<()> {
        let result = sqlx::query(
            "UPDATE nodes SET is_active = ?, updated_at = ? WHERE id = ? AND kind = 'rack_level_slot'",
        )
        .bind(active)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PlacementError::NodeNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn commit_placement(&self, write: &PlacementWrite) -> PlacementResult<()> {
        let mut tx = self.pool.begin().await?;

        // Первая запись в транзакции: ключ идемпотентности: дубликат отсекается сразу
        if let Some(op) = &write.operation {
            sqlx::query(
                r#"INSERT INTO placement_operations
                   (operation_id, kind, stock_id, movement_id, reception_id, issue_id, created_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&op.operation_id)
            .bind(op.kind.as_ref())
            .bind(&op.stock_id)
            .bind(&op.movement_id)
            .bind(&op.reception_id)
            .bind(&op.issue_id)
            .bind(op.created_at)
            .execute(&mut *tx)
            .await?;
        }

        match write.movement.kind {
            MovementKind::Reception => {
                insert_stock(&mut tx, &write.stock).await?;
                let reception = write.reception.as_ref().ok_or_else(|| {
                    PlacementError::Internal("reception write without a reception document".to_string())
                })?;
                insert_reception(&mut tx, reception).await?;
            }
            MovementKind::Move => {
                update_stock_location(&mut tx, &write.stock).await?;
            }
            MovementKind::Issue => {
                let issue = write.issue.as_ref().ok_or_else(|| {
                    PlacementError::Internal("issue write without an issue document".to_string())
                })?;
                insert_issue(&mut tx, issue).await?;
                update_stock_location(&mut tx, &write.stock).await?;
            }
        }

        // Сначала освобождаем источник, затем занимаем назначение
        let weight = write.stock.weight;
        if let Some(path) = &write.source_path {
            apply_node_delta(&mut tx, path, -weight, -1).await?;
        }
        if let Some(path) = &write.destination_path {
            apply_node_delta(&mut tx, path, weight, 1).await?;
        }

        audit::append(&mut tx, &write.movement).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn stock_history(&self, stock_id: &str) -> PlacementResult<Vec<MovementRecord>> {
        audit::history_for_stock(&self.pool, stock_id).await
    }

    async fn recent_movements(&self, limit: i64) -> PlacementResult<Vec<MovementRecord>> {
        audit::recent(&self.pool, limit).await
    }
}

// ==================== TX HELPERS ====================

async fn insert_stock(conn: &mut SqliteConnection, stock: &Stock) -> PlacementResult<()> {
    let (room, slot) = Location::to_columns(stock.location.as_ref());
    sqlx::query(
        r#"INSERT INTO stocks
           (id, product_id, weight, product_count, waiting_room_id, rack_level_slot_id,
            is_issued, reception_id, issue_id, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&stock.id)
    .bind(&stock.product_id)
    .bind(stock.weight)
    .bind(stock.product_count)
    .bind(room)
    .bind(slot)
    .bind(stock.is_issued)
    .bind(&stock.reception_id)
    .bind(&stock.issue_id)
    .bind(stock.created_at)
    .bind(stock.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn update_stock_location(conn: &mut SqliteConnection, stock: &Stock) -> PlacementResult<()> {
    let (room, slot) = Location::to_columns(stock.location.as_ref());
    let result = sqlx::query(
        r#"UPDATE stocks
           SET waiting_room_id = ?, rack_level_slot_id = ?, is_issued = ?, issue_id = ?, updated_at = ?
           WHERE id = ? AND is_issued = 0"#,
    )
    .bind(room)
    .bind(slot)
    .bind(stock.is_issued)
    .bind(&stock.issue_id)
    .bind(stock.updated_at)
    .bind(&stock.id)
    .execute(conn)
    .await?;

    if result.rows_affected() != 1 {
        return Err(PlacementError::Conflict(format!("stock '{}' changed concurrently", stock.id)));
    }
    Ok(())
}

async fn insert_reception(conn: &mut SqliteConnection, reception: &ReceptionRecord) -> PlacementResult<()> {
    let (room, slot) = Location::to_columns(Some(&reception.destination));
    sqlx::query(
        r#"INSERT INTO receptions
           (id, stock_id, product_id, product_count, weight, waiting_room_id, rack_level_slot_id,
            actor_user_id, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&reception.id)
    .bind(&reception.stock_id)
    .bind(&reception.product_id)
    .bind(reception.product_count)
    .bind(reception.weight)
    .bind(room)
    .bind(slot)
    .bind(&reception.actor_user_id)
    .bind(reception.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_issue(conn: &mut SqliteConnection, issue: &IssueRecord) -> PlacementResult<()> {
    let (room, slot) = Location::to_columns(Some(&issue.from_location));
    sqlx::query(
        r#"INSERT INTO issues (id, stock_id, waiting_room_id, rack_level_slot_id, actor_user_id, created_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&issue.id)
    .bind(&issue.stock_id)
    .bind(room)
    .bind(slot)
    .bind(&issue.actor_user_id)
    .bind(issue.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Adds a weight delta to every node of the path; count moves only on
/// stock-counting kinds.
async fn apply_node_delta(
    conn: &mut SqliteConnection,
    path: &[String],
    weight_delta: f64,
    count_delta: i64,
) -> PlacementResult<()> {
    let now = Utc::now();
    for id in path {
        let result = sqlx::query(
            r#"UPDATE nodes
               SET occupied_weight = ROUND(MAX(0.0, occupied_weight + ?), 6),
                   occupied_count = occupied_count
                       + CASE WHEN kind IN ('rack_level_slot', 'rack_level', 'waiting_room') THEN ? ELSE 0 END,
                   updated_at = ?
               WHERE id = ?"#,
        )
        .bind(weight_delta)
        .bind(count_delta)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() != 1 {
            return Err(PlacementError::NodeNotFound(id.clone()));
        }
    }
    Ok(())
}
