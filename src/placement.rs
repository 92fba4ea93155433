// src/placement.rs
//! PlacementEngine: приёмка, перемещение и выдача стоков.
//!
//! Каждая операция: проверка прав → идемпотентность → резерв по пути(ям) →
//! SQL-транзакция (сток, документы, счётчики, журнал) → коммит в леджере.
//! Ошибка на любом шаге до коммита освобождает все резервы.

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Duration;
use uuid::Uuid;

use crate::actor::{ActorContext, Capability};
use crate::error::{PlacementError, PlacementResult};
use crate::ledger::{CapacityLedger, NodePath, RebuildReport};
use crate::locks::{KeyGuard, KeyedLocks};
use crate::models::{
    CapacityNode, CreateNodeRequest, CreateReceptionRequest, IssueRecord, Location, MovementKind,
    MovementRecord, NodeSnapshot, OperationRecord, ReceptionRecord, ResizeNodeRequest, Stock,
};
use crate::monitoring::Metrics;
use crate::repositories::{PlacementRepository, PlacementWrite};
use crate::reservation::ReservationProtocol;

/// Result of a placement operation; replays carry the original ids.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlacementOutcome {
    pub operation_id: Option<String>,
    pub kind: MovementKind,
    pub stock_id: String,
    pub movement_id: String,
    pub reception_id: Option<String>,
    pub issue_id: Option<String>,
    pub replayed: bool,
}

impl PlacementOutcome {
    fn replay_of(record: OperationRecord) -> Self {
        Self {
            operation_id: Some(record.operation_id),
            kind: record.kind,
            stock_id: record.stock_id,
            movement_id: record.movement_id,
            reception_id: record.reception_id,
            issue_id: record.issue_id,
            replayed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerReport {
    pub nodes_checked: usize,
    pub healthy: bool,
    pub violations: Vec<String>,
}

/// What a single placement changes, before it is persisted.
struct PlannedPlacement {
    kind: MovementKind,
    stock: Stock,
    source: Option<(Location, NodePath)>,
    destination: Option<(Location, NodePath)>,
    reception: Option<ReceptionRecord>,
    issue: Option<IssueRecord>,
    /// Блокировки операции и стока; отпускаются только после коммита в леджере
    held: Vec<KeyGuard>,
}

pub struct PlacementEngine {
    ledger: Arc<CapacityLedger>,
    repo: Arc<dyn PlacementRepository>,
    stock_locks: KeyedLocks,
    operation_locks: KeyedLocks,
    metrics: Arc<Metrics>,
}

impl PlacementEngine {
    pub fn new(repo: Arc<dyn PlacementRepository>, metrics: Arc<Metrics>, lock_timeout: Duration) -> Self {
        Self {
            ledger: Arc::new(CapacityLedger::new(lock_timeout)),
            repo,
            // Операция над стоком держит его блокировку на время SQL-транзакции
            stock_locks: KeyedLocks::new(lock_timeout * 4),
            operation_locks: KeyedLocks::new(lock_timeout * 8),
            metrics,
        }
    }

    pub fn ledger(&self) -> &Arc<CapacityLedger> {
        &self.ledger
    }

    /// Loads the hierarchy and live stocks and rebuilds every counter.
    pub async fn bootstrap(&self) -> PlacementResult<RebuildReport> {
        let nodes = self.repo.load_nodes().await?;
        let stocks = self.repo.load_live_stocks().await?;
        let report = self.ledger.load(nodes, &stocks).await;

        for drift in &report.drift {
            warn!("⚠️ Ledger drift corrected on load: {}", drift);
        }
        info!(
            "📦 Ledger loaded: {} nodes, {} stocks in place",
            report.nodes, report.stocks
        );
        Ok(report)
    }

    // ==================== RECEPTION ====================

    #[tracing::instrument(skip_all, fields(user = %actor.user_id, product = %request.product_id))]
    pub async fn reception(
        &self,
        actor: &ActorContext,
        request: &CreateReceptionRequest,
    ) -> PlacementResult<PlacementOutcome> {
        let result = self.reception_inner(actor, request).await;
        self.observe(MovementKind::Reception, &result);
        result
    }

    async fn reception_inner(
        &self,
        actor: &ActorContext,
        request: &CreateReceptionRequest,
    ) -> PlacementResult<PlacementOutcome> {
        actor.require(Capability::ReceptStocks)?;
        validate_reception(request)?;

        let operation_id = request.operation_id.as_deref();
        let op_guard = match operation_id {
            Some(op) => Some(self.operation_locks.lock(op).await?),
            None => None,
        };
        if let Some(replay) = self.find_replay(operation_id, MovementKind::Reception, None).await? {
            return Ok(replay);
        }

        let destination_path = self.ledger.resolve(&request.destination).await?;
        let now = Utc::now();
        let stock_id = Uuid::new_v4().to_string();
        let reception_id = Uuid::new_v4().to_string();

        let stock = Stock {
            id: stock_id.clone(),
            product_id: request.product_id.trim().to_string(),
            weight: request.weight,
            product_count: request.count,
            location: Some(request.destination.clone()),
            is_issued: false,
            reception_id: reception_id.clone(),
            issue_id: None,
            created_at: now,
            updated_at: now,
        };
        let reception = ReceptionRecord {
            id: reception_id,
            stock_id,
            product_id: stock.product_id.clone(),
            product_count: stock.product_count,
            weight: stock.weight,
            destination: request.destination.clone(),
            actor_user_id: actor.user_id.clone(),
            created_at: now,
        };

        let plan = PlannedPlacement {
            kind: MovementKind::Reception,
            stock,
            source: None,
            destination: Some((request.destination.clone(), destination_path)),
            reception: Some(reception),
            issue: None,
            held: op_guard.into_iter().collect(),
        };
        self.execute(actor, plan, operation_id).await
    }

    // ==================== MOVE ====================

    #[tracing::instrument(skip_all, fields(user = %actor.user_id, stock = %stock_id))]
    pub async fn move_stock(
        &self,
        actor: &ActorContext,
        stock_id: &str,
        destination: &Location,
        operation_id: Option<&str>,
    ) -> PlacementResult<PlacementOutcome> {
        let result = self.move_inner(actor, stock_id, destination, operation_id).await;
        self.observe(MovementKind::Move, &result);
        result
    }

    async fn move_inner(
        &self,
        actor: &ActorContext,
        stock_id: &str,
        destination: &Location,
        operation_id: Option<&str>,
    ) -> PlacementResult<PlacementOutcome> {
        actor.require(Capability::MoveStocks)?;

        let op_guard = match operation_id {
            Some(op) => Some(self.operation_locks.lock(op).await?),
            None => None,
        };
        if let Some(replay) = self.find_replay(operation_id, MovementKind::Move, Some(stock_id)).await? {
            return Ok(replay);
        }

        let stock_guard = self.stock_locks.lock(stock_id).await?;
        let mut stock = self.live_stock(stock_id).await?;
        let source = current_location(&stock)?;
        if &source == destination {
            return Err(PlacementError::SameLocation(source.to_string()));
        }

        let destination_path = self.ledger.resolve(destination).await?;
        let source_path = self.ledger.resolve(&source).await?;

        stock.location = Some(destination.clone());
        stock.updated_at = Utc::now();

        let plan = PlannedPlacement {
            kind: MovementKind::Move,
            stock,
            source: Some((source, source_path)),
            destination: Some((destination.clone(), destination_path)),
            reception: None,
            issue: None,
            held: op_guard.into_iter().chain(Some(stock_guard)).collect(),
        };
        self.execute(actor, plan, operation_id).await
    }

    // ==================== ISSUE ====================

    #[tracing::instrument(skip_all, fields(user = %actor.user_id, stock = %stock_id))]
    pub async fn issue(
        &self,
        actor: &ActorContext,
        stock_id: &str,
        operation_id: Option<&str>,
    ) -> PlacementResult<PlacementOutcome> {
        let result = self.issue_inner(actor, stock_id, operation_id).await;
        self.observe(MovementKind::Issue, &result);
        result
    }

    async fn issue_inner(
        &self,
        actor: &ActorContext,
        stock_id: &str,
        operation_id: Option<&str>,
    ) -> PlacementResult<PlacementOutcome> {
        actor.require(Capability::IssueStocks)?;

        let op_guard = match operation_id {
            Some(op) => Some(self.operation_locks.lock(op).await?),
            None => None,
        };
        if let Some(replay) = self.find_replay(operation_id, MovementKind::Issue, Some(stock_id)).await? {
            return Ok(replay);
        }

        let stock_guard = self.stock_locks.lock(stock_id).await?;
        let mut stock = self.live_stock(stock_id).await?;
        let source = current_location(&stock)?;
        let source_path = self.ledger.resolve(&source).await?;

        let now = Utc::now();
        let issue = IssueRecord {
            id: Uuid::new_v4().to_string(),
            stock_id: stock.id.clone(),
            from_location: source.clone(),
            actor_user_id: actor.user_id.clone(),
            created_at: now,
        };
        stock.location = None;
        stock.is_issued = true;
        stock.issue_id = Some(issue.id.clone());
        stock.updated_at = now;

        let plan = PlannedPlacement {
            kind: MovementKind::Issue,
            stock,
            source: Some((source, source_path)),
            destination: None,
            reception: None,
            issue: Some(issue),
            held: op_guard.into_iter().chain(Some(stock_guard)).collect(),
        };
        self.execute(actor, plan, operation_id).await
    }

    // ==================== PROTOCOL DRIVER ====================

    async fn execute(
        &self,
        actor: &ActorContext,
        plan: PlannedPlacement,
        operation_id: Option<&str>,
    ) -> PlacementResult<PlacementOutcome> {
        let PlannedPlacement {
            kind,
            stock,
            source,
            destination,
            reception,
            issue,
            held,
        } = plan;

        let mut protocol = ReservationProtocol::begin(
            self.ledger.clone(),
            &stock.id,
            stock.weight,
            source.as_ref().map(|(_, path)| path.clone()),
            destination.as_ref().map(|(_, path)| path.clone()),
        )
        .await?;
        protocol.reserve_all().await?;

        let movement = MovementRecord {
            id: Uuid::new_v4().to_string(),
            operation_id: operation_id.map(str::to_string),
            kind,
            stock_id: stock.id.clone(),
            actor_user_id: actor.user_id.clone(),
            moved_at: stock.updated_at,
            from_location: source.as_ref().map(|(location, _)| location.clone()),
            to_location: destination.as_ref().map(|(location, _)| location.clone()),
            reception_id: reception.as_ref().map(|r| r.id.clone()),
            issue_id: issue.as_ref().map(|i| i.id.clone()),
        };
        let outcome = PlacementOutcome {
            operation_id: movement.operation_id.clone(),
            kind,
            stock_id: stock.id.clone(),
            movement_id: movement.id.clone(),
            reception_id: movement.reception_id.clone(),
            issue_id: movement.issue_id.clone(),
            replayed: false,
        };

        let write = PlacementWrite {
            operation: operation_id.map(|op| OperationRecord {
                operation_id: op.to_string(),
                kind,
                stock_id: stock.id.clone(),
                movement_id: movement.id.clone(),
                reception_id: movement.reception_id.clone(),
                issue_id: movement.issue_id.clone(),
                created_at: movement.moved_at,
            }),
            stock,
            reception,
            issue,
            source_path: source.map(|(_, path)| path),
            destination_path: destination.map(|(_, path)| path),
            movement,
        };

        // Запись в БД и коммит в леджере идут одной задачей: отмена вызывающего
        // future не может разделить их
        let repo = self.repo.clone();
        let write = tokio::spawn(async move {
            let _held = held;
            if let Err(e) = repo.commit_placement(&write).await {
                protocol.abort().await;
                return Err(e);
            }
            protocol.commit().await?;
            Ok::<_, PlacementError>(write)
        })
        .await
        .map_err(|e| PlacementError::Internal(format!("placement task failed: {}", e)))??;

        info!(
            "📍 {} committed: stock {} {} → {} by {}",
            kind,
            write.stock.id,
            describe(write.movement.from_location.as_ref()),
            describe(write.movement.to_location.as_ref()),
            actor.user_id
        );
        Ok(outcome)
    }

    /// Returns the original outcome when the operation id was already used.
    async fn find_replay(
        &self,
        operation_id: Option<&str>,
        kind: MovementKind,
        stock_id: Option<&str>,
    ) -> PlacementResult<Option<PlacementOutcome>> {
        let Some(operation_id) = operation_id else {
            return Ok(None);
        };
        let Some(record) = self.repo.find_operation(operation_id).await? else {
            return Ok(None);
        };

        if record.kind != kind || stock_id.is_some_and(|id| id != record.stock_id) {
            return Err(PlacementError::OperationReused(format!(
                "operation id '{}' was already used for a {} of stock '{}'",
                operation_id, record.kind, record.stock_id
            )));
        }
        debug!("Replaying operation {} ({})", operation_id, kind);
        Ok(Some(PlacementOutcome::replay_of(record)))
    }

    async fn live_stock(&self, stock_id: &str) -> PlacementResult<Stock> {
        let stock = self
            .repo
            .get_stock(stock_id)
            .await?
            .ok_or_else(|| PlacementError::StockNotFound(stock_id.to_string()))?;
        if stock.is_issued {
            return Err(PlacementError::StockAlreadyIssued(stock_id.to_string()));
        }
        Ok(stock)
    }

    fn observe(&self, kind: MovementKind, result: &PlacementResult<PlacementOutcome>) {
        match result {
            Ok(outcome) if outcome.replayed => self.metrics.increment_placements_replayed(),
            Ok(_) => self.metrics.increment_placements_committed(),
            Err(e) if e.is_transient() => {
                self.metrics.increment_placements_rejected();
                warn!("⏳ {} rejected, safe to retry: {}", kind, e);
            }
            Err(e) => {
                self.metrics.increment_placements_rejected();
                debug!("{} rejected: {}", kind, e);
            }
        }
    }

    // ==================== TOPOLOGY ====================

    pub async fn create_node(&self, actor: &ActorContext, request: &CreateNodeRequest) -> PlacementResult<NodeSnapshot> {
        actor.require(Capability::ManageLocations)?;
        if !(request.max_weight.is_finite() && request.max_weight > 0.0) {
            return Err(PlacementError::InvalidRequest("max_weight must be positive".to_string()));
        }
        if request.max_count < 0 {
            return Err(PlacementError::InvalidRequest("max_count cannot be negative".to_string()));
        }

        let node = CapacityNode::new(
            Uuid::new_v4().to_string(),
            request.kind,
            request.parent_id.clone(),
            request.code.trim(),
            request.max_weight,
            request.max_count,
        );
        let repo = self.repo.clone();
        let snapshot = self
            .ledger
            .register(node, move |node| async move { repo.insert_node(&node).await })
            .await?;

        info!("🏗️ {} '{}' registered ({}) by {}", snapshot.kind, snapshot.code, snapshot.id, actor.user_id);
        Ok(snapshot)
    }

    pub async fn resize_node(
        &self,
        actor: &ActorContext,
        node_id: &str,
        request: &ResizeNodeRequest,
    ) -> PlacementResult<NodeSnapshot> {
        actor.require(Capability::ManageLocations)?;
        if request.max_weight.is_none() && request.max_count.is_none() {
            return Err(PlacementError::InvalidRequest("nothing to change".to_string()));
        }

        let repo = self.repo.clone();
        let id = node_id.to_string();
        let snapshot = self
            .ledger
            .resize(node_id, request.max_weight, request.max_count, move |weight, count| async move {
                repo.update_node_limits(&id, weight, count).await
            })
            .await?;

        info!(
            "📐 Node {} resized to {:.3} kg / {} {} by {}",
            node_id, snapshot.max_weight, snapshot.count_label, snapshot.max_count, actor.user_id
        );
        Ok(snapshot)
    }

    pub async fn set_slot_active(&self, actor: &ActorContext, slot_id: &str, active: bool) -> PlacementResult<NodeSnapshot> {
        actor.require(Capability::ManageLocations)?;

        let repo = self.repo.clone();
        let id = slot_id.to_string();
        let snapshot = self
            .ledger
            .set_slot_active(slot_id, active, move || async move { repo.set_slot_active(&id, active).await })
            .await?;

        info!("🔌 Slot {} is_active={} by {}", slot_id, active, actor.user_id);
        Ok(snapshot)
    }

    // ==================== READS ====================

    pub async fn node_snapshot(&self, node_id: &str) -> PlacementResult<NodeSnapshot> {
        self.ledger.snapshot(node_id).await
    }

    pub async fn all_snapshots(&self) -> PlacementResult<Vec<NodeSnapshot>> {
        self.ledger.snapshot_all().await
    }

    pub async fn get_stock(&self, stock_id: &str) -> PlacementResult<Stock> {
        self.repo
            .get_stock(stock_id)
            .await?
            .ok_or_else(|| PlacementError::StockNotFound(stock_id.to_string()))
    }

    pub async fn stock_history(&self, stock_id: &str) -> PlacementResult<Vec<MovementRecord>> {
        self.get_stock(stock_id).await?;
        self.repo.stock_history(stock_id).await
    }

    pub async fn recent_movements(&self, limit: i64) -> PlacementResult<Vec<MovementRecord>> {
        self.repo.recent_movements(limit).await
    }

    pub async fn verify(&self) -> PlacementResult<LedgerReport> {
        let violations = self.ledger.verify_invariants().await?;
        Ok(LedgerReport {
            nodes_checked: self.ledger.len().await,
            healthy: violations.is_empty(),
            violations,
        })
    }
}

fn validate_reception(request: &CreateReceptionRequest) -> PlacementResult<()> {
    if request.product_id.trim().is_empty() {
        return Err(PlacementError::InvalidRequest("product_id is required".to_string()));
    }
    if request.count < 1 {
        return Err(PlacementError::InvalidRequest("count must be positive".to_string()));
    }
    if !(request.weight.is_finite() && request.weight > 0.0) {
        return Err(PlacementError::InvalidRequest("weight must be positive".to_string()));
    }
    Ok(())
}

fn current_location(stock: &Stock) -> PlacementResult<Location> {
    stock
        .location
        .clone()
        .ok_or_else(|| PlacementError::Internal(format!("live stock '{}' has no location", stock.id)))
}

fn describe(location: Option<&Location>) -> String {
    location.map_or_else(|| "∅".to_string(), |l| l.to_string())
}

// ==================== TESTS ====================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Capabilities;
    use crate::db::tests::memory_pool;
    use crate::models::{NodeKind, ResizeNodeRequest};
    use crate::repositories::SqlitePlacementRepository;
    use async_trait::async_trait;
    use futures::future::join_all;
    use sqlx::SqlitePool;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    struct Site {
        engine: Arc<PlacementEngine>,
        pool: SqlitePool,
        warehouse: String,
        section: String,
        rack: String,
        level: String,
        slots: Vec<String>,
        waiting_room: String,
    }

    fn admin() -> ActorContext {
        ActorContext::new("admin", Capabilities::all())
    }

    fn node(kind: NodeKind, parent: Option<&str>, code: &str, max_weight: f64, max_count: i64) -> CreateNodeRequest {
        CreateNodeRequest {
            kind,
            parent_id: parent.map(str::to_string),
            code: code.to_string(),
            max_weight,
            max_count,
        }
    }

    async fn build_site(repo: Arc<dyn PlacementRepository>, pool: SqlitePool) -> Site {
        let engine = Arc::new(PlacementEngine::new(repo, Arc::new(Metrics::new()), Duration::from_secs(2)));
        let a = admin();

        let warehouse = engine.create_node(&a, &node(NodeKind::Warehouse, None, "W1", 10_000.0, 10)).await.unwrap().id;
        let section = engine.create_node(&a, &node(NodeKind::Section, Some(&warehouse), "S1", 5_000.0, 5)).await.unwrap().id;
        let rack = engine.create_node(&a, &node(NodeKind::Rack, Some(&section), "R1", 1_000.0, 5)).await.unwrap().id;
        let level = engine.create_node(&a, &node(NodeKind::RackLevel, Some(&rack), "L1", 100.0, 4)).await.unwrap().id;

        let mut slots = Vec::new();
        for i in 1..=4 {
            let code = format!("L1-{i}");
            let slot = engine
                .create_node(&a, &node(NodeKind::RackLevelSlot, Some(&level), &code, 100.0, 1))
                .await
                .unwrap();
            slots.push(slot.id);
        }
        let waiting_room = engine
            .create_node(&a, &node(NodeKind::WaitingRoom, Some(&warehouse), "WR", 1_000.0, 20))
            .await
            .unwrap()
            .id;

        Site { engine, pool, warehouse, section, rack, level, slots, waiting_room }
    }

    async fn site() -> Site {
        let pool = memory_pool().await;
        let repo = Arc::new(SqlitePlacementRepository::new(pool.clone()));
        build_site(repo, pool).await
    }

    fn receive(weight: f64, destination: Location, op: Option<&str>) -> CreateReceptionRequest {
        CreateReceptionRequest {
            product_id: "prod-1".to_string(),
            count: 1,
            weight,
            destination,
            operation_id: op.map(str::to_string),
        }
    }

    impl Site {
        fn slot(&self, i: usize) -> Location {
            Location::RackLevelSlot(self.slots[i].clone())
        }

        fn room(&self) -> Location {
            Location::WaitingRoom(self.waiting_room.clone())
        }

        async fn snap(&self, id: &str) -> NodeSnapshot {
            self.engine.node_snapshot(id).await.unwrap()
        }

        async fn assert_consistent(&self) {
            let report = self.engine.verify().await.unwrap();
            assert!(report.healthy, "violations: {:?}", report.violations);
        }
    }

    #[tokio::test]
    async fn test_rack_level_weight_scenario() {
        let site = site().await;
        let a = admin();

        site.engine.reception(&a, &receive(30.0, site.slot(0), None)).await.unwrap();
        let level = site.snap(&site.level).await;
        assert_eq!(level.occupied_weight, 30.0);
        assert_eq!(level.available_weight, 70.0);
        assert_eq!(level.occupied_count, 1);

        let err = site.engine.reception(&a, &receive(80.0, site.slot(1), None)).await.unwrap_err();
        assert!(matches!(err, PlacementError::CapacityExceeded { ref node_id, .. } if node_id == &site.level));

        let level = site.snap(&site.level).await;
        assert_eq!(level.occupied_weight, 30.0);
        assert_eq!(level.occupied_count, 1);
        assert_eq!(level.reserved_weight, 0.0);
        assert_eq!(level.weight_to_reserve, 0.0);
        assert!(site.snap(&site.slots[1]).await.stock_id.is_none());
        site.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_move_to_inactive_slot_changes_nothing() {
        let site = site().await;
        let a = admin();
        let stock = site.engine.reception(&a, &receive(30.0, site.slot(0), None)).await.unwrap().stock_id;
        site.engine.set_slot_active(&a, &site.slots[2], false).await.unwrap();

        let err = site.engine.move_stock(&a, &stock, &site.slot(2), None).await.unwrap_err();
        assert!(matches!(err, PlacementError::SlotInactive(_)));

        let slot = site.snap(&site.slots[0]).await;
        assert_eq!(slot.stock_id.as_deref(), Some(stock.as_str()));
        assert_eq!(slot.occupied_weight, 30.0);
        let level = site.snap(&site.level).await;
        assert_eq!(level.occupied_weight, 30.0);
        assert_eq!(level.occupied_count, 1);

        let stored = site.engine.get_stock(&stock).await.unwrap();
        assert_eq!(stored.location, Some(site.slot(0)));
    }

    #[tokio::test]
    async fn test_issue_then_move_is_rejected() {
        let site = site().await;
        let a = admin();
        let stock = site.engine.reception(&a, &receive(25.0, site.room(), None)).await.unwrap().stock_id;

        let outcome = site.engine.issue(&a, &stock, None).await.unwrap();
        assert!(outcome.issue_id.is_some());

        let stored = site.engine.get_stock(&stock).await.unwrap();
        assert!(stored.is_issued);
        assert!(stored.location.is_none());
        let room = site.snap(&site.waiting_room).await;
        assert_eq!(room.occupied_weight, 0.0);
        assert_eq!(room.occupied_count, 0);

        let err = site.engine.move_stock(&a, &stock, &site.slot(0), None).await.unwrap_err();
        assert!(matches!(err, PlacementError::StockAlreadyIssued(_)));
        let err = site.engine.issue(&a, &stock, None).await.unwrap_err();
        assert!(matches!(err, PlacementError::StockAlreadyIssued(_)));
    }

    #[tokio::test]
    async fn test_round_trip_restores_ancestors() {
        let site = site().await;
        let a = admin();
        let ids = [&site.warehouse, &site.section, &site.rack, &site.level, &site.waiting_room];
        let mut before = Vec::new();
        for id in ids {
            before.push(site.snap(id).await);
        }

        let stock = site.engine.reception(&a, &receive(42.5, site.room(), None)).await.unwrap().stock_id;
        site.engine.move_stock(&a, &stock, &site.slot(3), None).await.unwrap();
        assert_eq!(site.snap(&site.warehouse).await.occupied_weight, 42.5);
        assert_eq!(site.snap(&site.waiting_room).await.occupied_weight, 0.0);
        site.assert_consistent().await;

        site.engine.issue(&a, &stock, None).await.unwrap();
        for (id, snapshot) in ids.iter().zip(before) {
            assert_eq!(site.snap(id).await, snapshot, "node {id}");
        }

        let history = site.engine.stock_history(&stock).await.unwrap();
        let kinds: Vec<MovementKind> = history.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MovementKind::Reception, MovementKind::Move, MovementKind::Issue]);
        assert_eq!(history[1].from_location, Some(site.room()));
        assert_eq!(history[1].to_location, Some(site.slot(3)));
        assert_eq!(history[2].to_location, None);
    }

    #[tokio::test]
    async fn test_concurrent_moves_to_one_slot() {
        let site = site().await;
        let a = admin();
        let mut stocks = Vec::new();
        for _ in 0..6 {
            let outcome = site.engine.reception(&a, &receive(5.0, site.room(), None)).await.unwrap();
            stocks.push(outcome.stock_id);
        }

        let target = site.slot(3);
        let moves = stocks.iter().map(|stock| {
            let engine = site.engine.clone();
            let target = target.clone();
            let stock = stock.clone();
            async move { engine.move_stock(&admin(), &stock, &target, None).await }
        });
        let results = join_all(moves).await;

        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        for result in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(
                matches!(result, PlacementError::SlotOccupied(_) | PlacementError::CapacityExceeded { .. }),
                "unexpected error {result}"
            );
        }

        assert_eq!(site.snap(&site.waiting_room).await.occupied_count, 5);
        assert_eq!(site.snap(&site.slots[3]).await.occupied_weight, 5.0);
        site.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_same_location_and_unknown_stock() {
        let site = site().await;
        let a = admin();
        let stock = site.engine.reception(&a, &receive(5.0, site.slot(0), None)).await.unwrap().stock_id;

        assert!(matches!(
            site.engine.move_stock(&a, &stock, &site.slot(0), None).await,
            Err(PlacementError::SameLocation(_))
        ));
        assert!(matches!(
            site.engine.move_stock(&a, "missing", &site.slot(1), None).await,
            Err(PlacementError::StockNotFound(_))
        ));
        assert!(matches!(
            site.engine.issue(&a, "missing", None).await,
            Err(PlacementError::StockNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_destination() {
        let site = site().await;
        let a = admin();
        // a rack level is not a leaf
        let wrong = Location::RackLevelSlot(site.level.clone());
        assert!(matches!(
            site.engine.reception(&a, &receive(1.0, wrong, None)).await,
            Err(PlacementError::InvalidLocation(_))
        ));
        let mut bad = receive(1.0, site.room(), None);
        bad.count = 0;
        assert!(matches!(
            site.engine.reception(&a, &bad).await,
            Err(PlacementError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_capabilities_are_enforced() {
        let site = site().await;
        let receiver = ActorContext::new("clerk", Capabilities::parse("can_recept_stocks"));
        let stock = site.engine.reception(&receiver, &receive(5.0, site.room(), None)).await.unwrap().stock_id;

        assert!(matches!(
            site.engine.move_stock(&receiver, &stock, &site.slot(0), None).await,
            Err(PlacementError::NotPermitted(Capability::MoveStocks))
        ));
        assert!(matches!(
            site.engine.issue(&receiver, &stock, None).await,
            Err(PlacementError::NotPermitted(Capability::IssueStocks))
        ));
        assert!(site
            .engine
            .create_node(&receiver, &node(NodeKind::WaitingRoom, Some(&site.warehouse), "WR2", 10.0, 1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_operation_id_replays_original_outcome() {
        let site = site().await;
        let a = admin();

        let first = site.engine.reception(&a, &receive(10.0, site.room(), Some("op-1"))).await.unwrap();
        let second = site.engine.reception(&a, &receive(10.0, site.room(), Some("op-1"))).await.unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.stock_id, second.stock_id);
        assert_eq!(site.snap(&site.waiting_room).await.occupied_weight, 10.0);

        // same id, different operation
        assert!(matches!(
            site.engine.issue(&a, &first.stock_id, Some("op-1")).await,
            Err(PlacementError::OperationReused(_))
        ));

        let moved = site.engine.move_stock(&a, &first.stock_id, &site.slot(0), Some("op-2")).await.unwrap();
        let again = site.engine.move_stock(&a, &first.stock_id, &site.slot(0), Some("op-2")).await.unwrap();
        assert_eq!(moved.movement_id, again.movement_id);
        assert!(again.replayed);
        assert_eq!(site.engine.stock_history(&first.stock_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_operation_is_not_recorded_for_replay() {
        let site = site().await;
        let a = admin();
        assert!(site.engine.reception(&a, &receive(5_000.0, site.room(), Some("op-x"))).await.is_err());
        // a corrected retry under the same id goes through
        let ok = site.engine.reception(&a, &receive(50.0, site.room(), Some("op-x"))).await.unwrap();
        assert!(!ok.replayed);
    }

    #[derive(Clone)]
    enum CommitMode {
        /// Every placement write fails.
        Fail,
        /// Moves are persisted, then held until `resume` is signalled.
        PauseMoves { persisted: Arc<Notify>, resume: Arc<Notify> },
    }

    /// Real storage with scripted placement commits.
    struct ScriptedCommits {
        inner: SqlitePlacementRepository,
        mode: CommitMode,
    }

    #[async_trait]
    impl PlacementRepository for ScriptedCommits {
        async fn load_nodes(&self) -> PlacementResult<Vec<CapacityNode>> {
            self.inner.load_nodes().await
        }
        async fn load_live_stocks(&self) -> PlacementResult<Vec<Stock>> {
            self.inner.load_live_stocks().await
        }
        async fn get_stock(&self, id: &str) -> PlacementResult<Option<Stock>> {
            self.inner.get_stock(id).await
        }
        async fn find_operation(&self, operation_id: &str) -> PlacementResult<Option<OperationRecord>> {
            self.inner.find_operation(operation_id).await
        }
        async fn insert_node(&self, node: &CapacityNode) -> PlacementResult<()> {
            self.inner.insert_node(node).await
        }
        async fn update_node_limits(&self, id: &str, max_weight: f64, max_count: i64) -> PlacementResult<()> {
            self.inner.update_node_limits(id, max_weight, max_count).await
        }
        async fn set_slot_active(&self, id: &str, active: bool) -> PlacementResult<()> {
            self.inner.set_slot_active(id, active).await
        }
        async fn commit_placement(&self, write: &PlacementWrite) -> PlacementResult<()> {
            match &self.mode {
                CommitMode::Fail => Err(PlacementError::Internal("disk unavailable".to_string())),
                CommitMode::PauseMoves { persisted, resume } => {
                    self.inner.commit_placement(write).await?;
                    if write.movement.kind == MovementKind::Move {
                        persisted.notify_one();
                        resume.notified().await;
                    }
                    Ok(())
                }
            }
        }
        async fn stock_history(&self, stock_id: &str) -> PlacementResult<Vec<MovementRecord>> {
            self.inner.stock_history(stock_id).await
        }
        async fn recent_movements(&self, limit: i64) -> PlacementResult<Vec<MovementRecord>> {
            self.inner.recent_movements(limit).await
        }
    }

    async fn scripted_site(mode: CommitMode) -> Site {
        let pool = memory_pool().await;
        let repo = Arc::new(ScriptedCommits {
            inner: SqlitePlacementRepository::new(pool.clone()),
            mode,
        });
        build_site(repo, pool).await
    }

    #[tokio::test]
    async fn test_persistence_failure_releases_reservations() {
        let site = scripted_site(CommitMode::Fail).await;

        let err = site.engine.reception(&admin(), &receive(30.0, site.slot(0), None)).await.unwrap_err();
        assert!(matches!(err, PlacementError::Internal(_)));

        for id in [&site.slots[0], &site.level, &site.rack, &site.warehouse] {
            let snap = site.snap(id).await;
            assert_eq!(snap.reserved_weight, 0.0, "node {id}");
            assert_eq!(snap.occupied_weight, 0.0, "node {id}");
        }
        assert!(site.snap(&site.slots[0]).await.stock_id.is_none());
    }

    #[tokio::test]
    async fn test_move_dropped_during_commit_still_completes() {
        let persisted = Arc::new(Notify::new());
        let resume = Arc::new(Notify::new());
        let site = scripted_site(CommitMode::PauseMoves {
            persisted: persisted.clone(),
            resume: resume.clone(),
        })
        .await;
        let a = admin();
        let stock = site.engine.reception(&a, &receive(40.0, site.slot(0), None)).await.unwrap().stock_id;

        // Клиент отключился, пока транзакция перемещения уже записана
        let dest = site.slot(1);
        let move_fut = site.engine.move_stock(&a, &stock, &dest, None);
        tokio::select! {
            _ = move_fut => panic!("move finished while storage was paused"),
            _ = persisted.notified() => {}
        }

        // the stock stays locked until the ledger catches up
        assert!(timeout(Duration::from_millis(30), site.engine.issue(&a, &stock, None)).await.is_err());

        resume.notify_one();
        for _ in 0..100 {
            if site.snap(&site.slots[1]).await.stock_id.is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        let stored = site.engine.get_stock(&stock).await.unwrap();
        assert_eq!(stored.location, Some(site.slot(1)));
        assert_eq!(site.snap(&site.slots[1]).await.stock_id.as_deref(), Some(stock.as_str()));
        assert!(site.snap(&site.slots[0]).await.stock_id.is_none());
        for id in [&site.slots[0], &site.slots[1], &site.level, &site.rack, &site.warehouse] {
            let snap = site.snap(id).await;
            assert_eq!(snap.reserved_weight, 0.0, "node {id}");
            assert_eq!(snap.reserved_count, 0, "node {id}");
        }
        assert_eq!(site.snap(&site.level).await.occupied_weight, 40.0);
        site.assert_consistent().await;

        // ledger and storage agree
        let repo = Arc::new(SqlitePlacementRepository::new(site.pool.clone()));
        let restarted = PlacementEngine::new(repo, Arc::new(Metrics::new()), Duration::from_secs(1));
        let report = restarted.bootstrap().await.unwrap();
        assert!(report.drift.is_empty(), "drift: {:?}", report.drift);
        let mut before = site.engine.all_snapshots().await.unwrap();
        let mut after = restarted.all_snapshots().await.unwrap();
        before.sort_by(|x, y| x.id.cmp(&y.id));
        after.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_bootstrap_reproduces_committed_state() {
        let site = site().await;
        let a = admin();
        let s1 = site.engine.reception(&a, &receive(12.0, site.slot(0), None)).await.unwrap().stock_id;
        site.engine.reception(&a, &receive(8.0, site.room(), None)).await.unwrap();
        site.engine.move_stock(&a, &s1, &site.slot(1), None).await.unwrap();

        let repo = Arc::new(SqlitePlacementRepository::new(site.pool.clone()));
        let restarted = PlacementEngine::new(repo, Arc::new(Metrics::new()), Duration::from_secs(1));
        let report = restarted.bootstrap().await.unwrap();
        assert!(report.drift.is_empty(), "drift: {:?}", report.drift);
        assert_eq!(report.stocks, 2);

        let mut before = site.engine.all_snapshots().await.unwrap();
        let mut after = restarted.all_snapshots().await.unwrap();
        before.sort_by(|x, y| x.id.cmp(&y.id));
        after.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_resize_respects_usage() {
        let site = site().await;
        let a = admin();
        site.engine.reception(&a, &receive(60.0, site.slot(0), None)).await.unwrap();

        let shrink = ResizeNodeRequest { max_weight: Some(50.0), max_count: None };
        assert!(matches!(
            site.engine.resize_node(&a, &site.level, &shrink).await,
            Err(PlacementError::InvalidRequest(_))
        ));

        let grow = ResizeNodeRequest { max_weight: Some(150.0), max_count: None };
        let snapshot = site.engine.resize_node(&a, &site.level, &grow).await.unwrap();
        assert_eq!(snapshot.available_weight, 90.0);
        assert_eq!(site.engine.recent_movements(10).await.unwrap().len(), 1);
    }
}
