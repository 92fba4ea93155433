// src/audit.rs
//! Журнал перемещений (append-only).
//!
//! Запись добавляется внутри той же SQL-транзакции, что и изменение стока и
//! счётчиков узлов: либо видно всё вместе, либо ничего.

use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{PlacementError, PlacementResult};
use crate::models::{Location, MovementRecord, MovementRow};

const MOVEMENT_COLUMNS: &str = "id, operation_id, kind, stock_id, actor_user_id, moved_at, \
     from_waiting_room_id, from_rack_level_slot_id, to_waiting_room_id, to_rack_level_slot_id, \
     reception_id, issue_id";

/// Записать событие перемещения (внутри открытой транзакции)
pub async fn append(conn: &mut SqliteConnection, record: &MovementRecord) -> Result<(), sqlx::Error> {
    let (from_room, from_slot) = Location::to_columns(record.from_location.as_ref());
    let (to_room, to_slot) = Location::to_columns(record.to_location.as_ref());

    sqlx::query(
        r#"INSERT INTO movement_records
           (id, operation_id, kind, stock_id, actor_user_id, moved_at,
            from_waiting_room_id, from_rack_level_slot_id, to_waiting_room_id, to_rack_level_slot_id,
            reception_id, issue_id)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&record.id)
    .bind(&record.operation_id)
    .bind(record.kind.as_ref())
    .bind(&record.stock_id)
    .bind(&record.actor_user_id)
    .bind(record.moved_at)
    .bind(from_room)
    .bind(from_slot)
    .bind(to_room)
    .bind(to_slot)
    .bind(&record.reception_id)
    .bind(&record.issue_id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Полная история стока, от приёмки до выдачи
pub async fn history_for_stock(pool: &SqlitePool, stock_id: &str) -> PlacementResult<Vec<MovementRecord>> {
    let query = format!(
        "SELECT {} FROM movement_records WHERE stock_id = ? ORDER BY moved_at ASC, rowid ASC",
        MOVEMENT_COLUMNS
    );
    let rows: Vec<MovementRow> = sqlx::query_as(&query).bind(stock_id).fetch_all(pool).await?;
    into_records(rows)
}

pub async fn recent(pool: &SqlitePool, limit: i64) -> PlacementResult<Vec<MovementRecord>> {
    let query = format!(
        "SELECT {} FROM movement_records ORDER BY moved_at DESC, rowid DESC LIMIT ?",
        MOVEMENT_COLUMNS
    );
    let rows: Vec<MovementRow> = sqlx::query_as(&query).bind(limit).fetch_all(pool).await?;
    into_records(rows)
}

fn into_records(rows: Vec<MovementRow>) -> PlacementResult<Vec<MovementRecord>> {
    rows.into_iter()
        .map(|row| MovementRecord::try_from(row).map_err(PlacementError::Internal))
        .collect()
}
