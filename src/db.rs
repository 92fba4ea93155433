// src/db.rs - Database migrations for the placement ledger

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Enable foreign keys and WAL mode
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(pool)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(pool)
        .await?;

    // ==================== NODES ====================
    // Иерархия хранения; occupied_*: последнее зафиксированное состояние леджера
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL CHECK(kind IN (
                'warehouse', 'section', 'rack', 'rack_level', 'rack_level_slot', 'waiting_room'
            )),
            parent_id TEXT,
            code TEXT NOT NULL CHECK(length(code) > 0 AND length(code) <= 64),
            max_weight REAL NOT NULL CHECK(max_weight > 0),
            max_count INTEGER NOT NULL CHECK(max_count >= 0),
            occupied_weight REAL NOT NULL DEFAULT 0.0 CHECK(occupied_weight >= 0),
            occupied_count INTEGER NOT NULL DEFAULT 0 CHECK(occupied_count >= 0),
            is_active INTEGER NOT NULL DEFAULT 1 CHECK(is_active IN (0, 1)),
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            FOREIGN KEY (parent_id) REFERENCES nodes (id),
            CHECK(occupied_weight <= max_weight + 0.000001),
            CHECK(occupied_count <= max_count),
            CHECK(kind != 'rack_level_slot' OR max_count = 1),
            CHECK((kind = 'warehouse') = (parent_id IS NULL)),
            UNIQUE(parent_id, code)
        )
        "#,
    )
        .execute(pool)
        .await?;

    // ==================== STOCKS ====================
    // Сток лежит ровно в одном листе, либо нигде (после выдачи)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stocks (
            id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL CHECK(length(product_id) > 0 AND length(product_id) <= 100),
            weight REAL NOT NULL CHECK(weight > 0),
            product_count INTEGER NOT NULL CHECK(product_count > 0),
            waiting_room_id TEXT,
            rack_level_slot_id TEXT UNIQUE,
            is_issued INTEGER NOT NULL DEFAULT 0 CHECK(is_issued IN (0, 1)),
            reception_id TEXT NOT NULL,
            issue_id TEXT,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            FOREIGN KEY (waiting_room_id) REFERENCES nodes (id),
            FOREIGN KEY (rack_level_slot_id) REFERENCES nodes (id),
            CHECK(waiting_room_id IS NULL OR rack_level_slot_id IS NULL),
            CHECK(
                (is_issued = 1 AND waiting_room_id IS NULL AND rack_level_slot_id IS NULL AND issue_id IS NOT NULL)
                OR (is_issued = 0 AND issue_id IS NULL
                    AND (waiting_room_id IS NOT NULL OR rack_level_slot_id IS NOT NULL))
            )
        )
        "#,
    )
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS receptions (
            id TEXT PRIMARY KEY,
            stock_id TEXT NOT NULL UNIQUE,
            product_id TEXT NOT NULL,
            product_count INTEGER NOT NULL CHECK(product_count > 0),
            weight REAL NOT NULL CHECK(weight > 0),
            waiting_room_id TEXT,
            rack_level_slot_id TEXT,
            actor_user_id TEXT NOT NULL,
            created_at DATETIME NOT NULL,
            FOREIGN KEY (stock_id) REFERENCES stocks (id),
            CHECK((waiting_room_id IS NULL) != (rack_level_slot_id IS NULL))
        )
        "#,
    )
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS issues (
            id TEXT PRIMARY KEY,
            stock_id TEXT NOT NULL UNIQUE,
            waiting_room_id TEXT,
            rack_level_slot_id TEXT,
            actor_user_id TEXT NOT NULL,
            created_at DATETIME NOT NULL,
            FOREIGN KEY (stock_id) REFERENCES stocks (id),
            CHECK((waiting_room_id IS NULL) != (rack_level_slot_id IS NULL))
        )
        "#,
    )
        .execute(pool)
        .await?;

    // ==================== AUDIT ====================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS movement_records (
            id TEXT PRIMARY KEY,
            operation_id TEXT,
            kind TEXT NOT NULL CHECK(kind IN ('reception', 'move', 'issue')),
            stock_id TEXT NOT NULL,
            actor_user_id TEXT NOT NULL,
            moved_at DATETIME NOT NULL,
            from_waiting_room_id TEXT,
            from_rack_level_slot_id TEXT,
            to_waiting_room_id TEXT,
            to_rack_level_slot_id TEXT,
            reception_id TEXT,
            issue_id TEXT,
            CHECK(from_waiting_room_id IS NULL OR from_rack_level_slot_id IS NULL),
            CHECK(to_waiting_room_id IS NULL OR to_rack_level_slot_id IS NULL)
        )
        "#,
    )
        .execute(pool)
        .await?;

    // Идемпотентность: одна запись на успешную операцию
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS placement_operations (
            operation_id TEXT PRIMARY KEY CHECK(length(operation_id) > 0 AND length(operation_id) <= 128),
            kind TEXT NOT NULL CHECK(kind IN ('reception', 'move', 'issue')),
            stock_id TEXT NOT NULL,
            movement_id TEXT NOT NULL,
            reception_id TEXT,
            issue_id TEXT,
            created_at DATETIME NOT NULL
        )
        "#,
    )
        .execute(pool)
        .await?;

    // ==================== INDEXES ====================
    let index_queries = [
        "CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id)",
        "CREATE INDEX IF NOT EXISTS idx_nodes_kind ON nodes(kind)",
        "CREATE INDEX IF NOT EXISTS idx_stocks_waiting_room ON stocks(waiting_room_id)",
        "CREATE INDEX IF NOT EXISTS idx_stocks_live ON stocks(is_issued)",
        "CREATE INDEX IF NOT EXISTS idx_movements_stock ON movement_records(stock_id, moved_at)",
        "CREATE INDEX IF NOT EXISTS idx_movements_moved_at ON movement_records(moved_at)",
        "CREATE INDEX IF NOT EXISTS idx_operations_created_at ON placement_operations(created_at)",
    ];

    for query in index_queries.iter() {
        sqlx::query(query).execute(pool).await?;
    }

    Ok(())
}
