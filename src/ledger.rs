// src/ledger.rs
//! CapacityLedger: авторитетные счётчики занятости/резерва по каждому узлу.
//!
//! Каждый узел защищён собственным асинхронным мьютексом. Операции над
//! несколькими узлами берут блокировки строго в порядке возрастания id,
//! поэтому пересекающиеся пути не могут взаимно заблокироваться.
//!
//! Жизненный цикл изменения: `stage` (weight_to_reserve) → `reserve`
//! (reserved_*) → `commit` (occupied_*) либо `release`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tokio::time::{timeout, Duration};

use crate::error::{CapacityDimension, PlacementError, PlacementResult};
use crate::models::{CapacityNode, Location, NodeKind, NodeSnapshot, Stock, WEIGHT_EPSILON};

/// Node ids from a leaf up to the warehouse root.
pub type NodePath = Vec<String>;

const MAX_DEPTH: usize = 8;

struct NodeEntry {
    kind: NodeKind,
    parent_id: Option<String>,
    cell: Arc<AsyncMutex<CapacityNode>>,
}

type Guards = BTreeMap<String, OwnedMutexGuard<CapacityNode>>;

// ==================== TOKENS ====================

/// Provisional claim (positive deltas) or release (negative deltas) along a path.
#[derive(Debug)]
pub struct ReservationToken {
    path: NodePath,
    weight_delta: f64,
    count_delta: i64,
    stock_id: String,
}

impl ReservationToken {
    pub fn is_claim(&self) -> bool {
        self.weight_delta > 0.0
    }
}

/// Requested-but-not-yet-accepted weight registered on a destination path.
#[derive(Debug)]
pub struct StagedIntent {
    path: NodePath,
    weight: f64,
}

/// Outcome of rebuilding counters from stock rows.
#[derive(Debug, Default)]
pub struct RebuildReport {
    pub nodes: usize,
    pub stocks: usize,
    pub drift: Vec<String>,
}

// ==================== LEDGER ====================

pub struct CapacityLedger {
    nodes: RwLock<HashMap<String, NodeEntry>>,
    lock_timeout: Duration,
}

impl CapacityLedger {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            lock_timeout,
        }
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    // ==================== LOAD / REBUILD ====================

    /// Replaces the ledger contents with `nodes`, recomputing every occupied
    /// figure from the live `stocks`. Persisted figures that disagree with the
    /// recomputed ones are reported as drift.
    pub async fn load(&self, nodes: Vec<CapacityNode>, stocks: &[Stock]) -> RebuildReport {
        let (rebuilt, report) = rebuild(nodes, stocks);

        let mut map = self.nodes.write().await;
        map.clear();
        for node in rebuilt.into_values() {
            map.insert(
                node.id.clone(),
                NodeEntry {
                    kind: node.kind,
                    parent_id: node.parent_id.clone(),
                    cell: Arc::new(AsyncMutex::new(node)),
                },
            );
        }
        report
    }

    // ==================== PATHS ====================

    /// Resolves a stock location into the path of nodes it occupies.
    pub async fn resolve(&self, location: &Location) -> PlacementResult<NodePath> {
        let map = self.nodes.read().await;
        let leaf_id = location.node_id();
        let entry = map.get(leaf_id).ok_or_else(|| {
            PlacementError::InvalidLocation(format!("{} '{}' does not exist", location.kind(), leaf_id))
        })?;
        if entry.kind != location.kind() {
            return Err(PlacementError::InvalidLocation(format!(
                "node '{}' is a {}, not a {}",
                leaf_id,
                entry.kind,
                location.kind()
            )));
        }

        let mut path = vec![leaf_id.to_string()];
        let mut parent = entry.parent_id.clone();
        while let Some(parent_id) = parent {
            if path.len() > MAX_DEPTH {
                return Err(PlacementError::Internal(format!("node '{}' has a cyclic parent chain", leaf_id)));
            }
            let parent_entry = map
                .get(&parent_id)
                .ok_or_else(|| PlacementError::NodeNotFound(parent_id.clone()))?;
            parent = parent_entry.parent_id.clone();
            path.push(parent_id);
        }
        Ok(path)
    }

    async fn cells(&self, ids: &BTreeSet<String>) -> PlacementResult<Vec<(String, Arc<AsyncMutex<CapacityNode>>)>> {
        let map = self.nodes.read().await;
        ids.iter()
            .map(|id| {
                map.get(id)
                    .map(|entry| (id.clone(), entry.cell.clone()))
                    .ok_or_else(|| PlacementError::NodeNotFound(id.clone()))
            })
            .collect()
    }

    /// Locks the given nodes in ascending id order. `bounded` applies the
    /// configured lock timeout; commit/release paths wait unbounded because
    /// they must not fail after the persistence transaction succeeded.
    async fn lock_many<'a, I>(&self, ids: I, bounded: bool) -> PlacementResult<Guards>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let ordered: BTreeSet<String> = ids.into_iter().cloned().collect();
        let cells = self.cells(&ordered).await?;

        let mut guards = BTreeMap::new();
        for (id, cell) in cells {
            let guard = if bounded {
                timeout(self.lock_timeout, cell.lock_owned())
                    .await
                    .map_err(|_| PlacementError::LockTimeout(id.clone()))?
            } else {
                cell.lock_owned().await
            };
            guards.insert(id, guard);
        }
        Ok(guards)
    }

    async fn lock_one(&self, id: &str) -> PlacementResult<OwnedMutexGuard<CapacityNode>> {
        let key = id.to_string();
        let mut guards = self.lock_many(std::iter::once(&key), true).await?;
        guards
            .remove(id)
            .ok_or_else(|| PlacementError::NodeNotFound(id.to_string()))
    }

    // ==================== TWO-PHASE API ====================

    /// Registers `weight` as requested-but-pending on every node of `path`.
    pub async fn stage(&self, path: &[String], weight: f64) -> PlacementResult<StagedIntent> {
        let mut guards = self.lock_many(path, true).await?;
        for id in path {
            if let Some(node) = guards.get_mut(id) {
                node.weight_to_reserve += weight;
            }
        }
        Ok(StagedIntent {
            path: path.to_vec(),
            weight,
        })
    }

    pub async fn unstage(&self, intent: StagedIntent) {
        let guards = self.lock_many(&intent.path, false).await;
        match guards {
            Ok(mut guards) => {
                for id in &intent.path {
                    if let Some(node) = guards.get_mut(id) {
                        node.weight_to_reserve = settle(node.weight_to_reserve - intent.weight);
                    }
                }
            }
            Err(e) => log::error!("Failed to unstage intent on {:?}: {}", intent.path, e),
        }
    }

    /// Reserves a signed delta along `path`.
    ///
    /// Positive deltas claim headroom: every node is checked leaf-first and
    /// the first one lacking weight or count headroom is named in the error;
    /// nothing is applied unless all nodes pass. Negative deltas release what
    /// the stock currently occupies and never fail on capacity.
    pub async fn reserve(
        &self,
        path: &[String],
        weight_delta: f64,
        count_delta: i64,
        stock_id: &str,
    ) -> PlacementResult<ReservationToken> {
        if path.is_empty() {
            return Err(PlacementError::Internal("empty reservation path".to_string()));
        }
        if !weight_delta.is_finite() || weight_delta == 0.0 {
            return Err(PlacementError::InvalidRequest(format!(
                "weight delta must be a non-zero number, got {}",
                weight_delta
            )));
        }
        if count_delta != 0 && (count_delta > 0) != (weight_delta > 0.0) {
            return Err(PlacementError::InvalidRequest(
                "weight and count deltas must have the same sign".to_string(),
            ));
        }

        let mut guards = self.lock_many(path, true).await?;

        if weight_delta > 0.0 {
            for id in path {
                let node = guards
                    .get(id)
                    .ok_or_else(|| PlacementError::NodeNotFound(id.clone()))?;
                check_claim(node, weight_delta, count_delta, stock_id)?;
            }
            for id in path {
                if let Some(node) = guards.get_mut(id) {
                    let counted = if node.kind.counts_stock() { count_delta } else { 0 };
                    // Встречное освобождение того же стока гасит заявку, а не складывается с ней
                    let (credit_weight, credit_count) = node.release_credit(stock_id);
                    let netted = (weight_delta.min(credit_weight), counted.min(credit_count));
                    node.reserved_weight = settle(node.reserved_weight + weight_delta - netted.0);
                    node.reserved_count += counted - netted.1;
                    if netted.0 > 0.0 || netted.1 > 0 {
                        node.transfers.insert(stock_id.to_string(), netted);
                    }
                }
            }
        } else {
            for id in path {
                let node = guards
                    .get(id)
                    .ok_or_else(|| PlacementError::NodeNotFound(id.clone()))?;
                check_release(node, -weight_delta, -count_delta, stock_id)?;
            }
            for id in path {
                if let Some(node) = guards.get_mut(id) {
                    let count = if node.kind.counts_stock() { -count_delta } else { 0 };
                    node.releasing.insert(stock_id.to_string(), (-weight_delta, count));
                }
            }
        }

        Ok(ReservationToken {
            path: path.to_vec(),
            weight_delta,
            count_delta,
            stock_id: stock_id.to_string(),
        })
    }

    /// Applies the tokens atomically: claims move reserved → occupied,
    /// releases leave occupied. All involved nodes are locked together so
    /// readers never observe a half-applied transfer.
    pub async fn commit(&self, tokens: Vec<ReservationToken>) {
        let ids: Vec<String> = tokens.iter().flat_map(|t| t.path.iter().cloned()).collect();
        let mut guards = match self.lock_many(&ids, false).await {
            Ok(guards) => guards,
            Err(e) => {
                log::error!("Ledger commit could not lock {:?}: {}", ids, e);
                return;
            }
        };

        for token in &tokens {
            for id in &token.path {
                let Some(node) = guards.get_mut(id) else { continue };
                let counts = node.kind.counts_stock();
                if token.is_claim() {
                    let (netted_weight, netted_count) = node.transfers.remove(&token.stock_id).unwrap_or((0.0, 0));
                    node.reserved_weight = settle(node.reserved_weight - (token.weight_delta - netted_weight));
                    node.occupied_weight += token.weight_delta;
                    if counts {
                        node.reserved_count -= token.count_delta - netted_count;
                        node.occupied_count += token.count_delta;
                    }
                    if node.kind == NodeKind::RackLevelSlot {
                        node.stock_id = Some(token.stock_id.clone());
                    }
                } else {
                    node.releasing.remove(&token.stock_id);
                    node.occupied_weight = settle(node.occupied_weight + token.weight_delta);
                    if counts {
                        node.occupied_count = (node.occupied_count + token.count_delta).max(0);
                    }
                    if node.kind == NodeKind::RackLevelSlot
                        && node.stock_id.as_deref() == Some(token.stock_id.as_str())
                    {
                        node.stock_id = None;
                    }
                }
            }
        }
    }

    /// Undoes reservations that will not be committed.
    pub async fn release(&self, tokens: Vec<ReservationToken>) {
        if tokens.is_empty() {
            return;
        }
        let ids: Vec<String> = tokens.iter().flat_map(|t| t.path.iter().cloned()).collect();
        let mut guards = match self.lock_many(&ids, false).await {
            Ok(guards) => guards,
            Err(e) => {
                log::error!("Ledger release could not lock {:?}: {}", ids, e);
                return;
            }
        };

        for token in &tokens {
            for id in &token.path {
                let Some(node) = guards.get_mut(id) else { continue };
                if token.is_claim() {
                    let (netted_weight, netted_count) = node.transfers.remove(&token.stock_id).unwrap_or((0.0, 0));
                    node.reserved_weight = settle(node.reserved_weight - (token.weight_delta - netted_weight));
                    if node.kind.counts_stock() {
                        node.reserved_count = (node.reserved_count - (token.count_delta - netted_count)).max(0);
                    }
                } else {
                    node.releasing.remove(&token.stock_id);
                }
            }
        }
    }

    // ==================== READS ====================

    pub async fn snapshot(&self, id: &str) -> PlacementResult<NodeSnapshot> {
        let guard = self.lock_one(id).await?;
        Ok(guard.snapshot())
    }

    /// Consistent view of every node (all locks held while copying).
    pub async fn snapshot_all(&self) -> PlacementResult<Vec<NodeSnapshot>> {
        let ids: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        let guards = self.lock_many(&ids, true).await?;
        Ok(guards.values().map(|node| node.snapshot()).collect())
    }

    /// Checks per-node invariants and the parent/child sum invariants.
    pub async fn verify_invariants(&self) -> PlacementResult<Vec<String>> {
        let ids: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        let guards = self.lock_many(&ids, true).await?;

        let mut violations = Vec::new();
        let mut child_weight: HashMap<&str, f64> = HashMap::new();
        let mut child_stock_count: HashMap<&str, i64> = HashMap::new();

        for node in guards.values() {
            if let Err(e) = node.check_invariants() {
                violations.push(e);
            }
            if let Some(parent_id) = node.parent_id.as_deref() {
                *child_weight.entry(parent_id).or_default() += node.occupied_weight;
                if node.kind == NodeKind::RackLevelSlot {
                    *child_stock_count.entry(parent_id).or_default() += node.occupied_count;
                }
            }
        }

        for node in guards.values() {
            if node.kind.is_leaf() {
                continue;
            }
            let sum = child_weight.get(node.id.as_str()).copied().unwrap_or(0.0);
            if !weights_equal(sum, node.occupied_weight) {
                violations.push(format!(
                    "{} '{}': occupied_weight {:.3} != children sum {:.3}",
                    node.kind, node.id, node.occupied_weight, sum
                ));
            }
            if node.kind == NodeKind::RackLevel {
                let count = child_stock_count.get(node.id.as_str()).copied().unwrap_or(0);
                if count != node.occupied_count {
                    violations.push(format!(
                        "rack_level '{}': occupied slots {} != slot sum {}",
                        node.id, node.occupied_count, count
                    ));
                }
            }
        }
        Ok(violations)
    }

    // ==================== TOPOLOGY ====================

    /// Registers a new node under its parent. `persist` runs while the parent
    /// is locked; the node becomes visible only if it succeeds.
    pub async fn register<F, Fut>(&self, node: CapacityNode, persist: F) -> PlacementResult<NodeSnapshot>
    where
        F: FnOnce(CapacityNode) -> Fut,
        Fut: Future<Output = PlacementResult<()>>,
    {
        if self.nodes.read().await.contains_key(&node.id) {
            return Err(PlacementError::NodeExists(node.id.clone()));
        }

        let mut parent_guard = match (node.kind.parent_kind(), node.parent_id.as_deref()) {
            (None, None) => None,
            (None, Some(_)) => {
                return Err(PlacementError::InvalidRequest(format!("a {} cannot have a parent", node.kind)));
            }
            (Some(expected), None) => {
                return Err(PlacementError::InvalidRequest(format!(
                    "a {} must be registered under a {}",
                    node.kind, expected
                )));
            }
            (Some(expected), Some(parent_id)) => {
                let parent = self.lock_one(parent_id).await?;
                if parent.kind != expected {
                    return Err(PlacementError::InvalidRequest(format!(
                        "a {} must be registered under a {}, '{}' is a {}",
                        node.kind, expected, parent_id, parent.kind
                    )));
                }
                if parent.child_count >= parent.max_count {
                    return Err(PlacementError::capacity_exceeded(
                        parent_id,
                        parent.kind,
                        CapacityDimension::Count,
                        1.0,
                        (parent.max_count - parent.child_count) as f64,
                    ));
                }
                Some(parent)
            }
        };

        persist(node.clone()).await?;

        if let Some(parent) = parent_guard.as_mut() {
            parent.child_count += 1;
            if !parent.kind.counts_stock() {
                parent.occupied_count += 1;
            }
        }

        let snapshot = node.snapshot();
        self.nodes.write().await.insert(
            node.id.clone(),
            NodeEntry {
                kind: node.kind,
                parent_id: node.parent_id.clone(),
                cell: Arc::new(AsyncMutex::new(node)),
            },
        );
        Ok(snapshot)
    }

    /// Explicit resize; a node can never shrink below what it currently holds.
    pub async fn resize<F, Fut>(
        &self,
        id: &str,
        max_weight: Option<f64>,
        max_count: Option<i64>,
        persist: F,
    ) -> PlacementResult<NodeSnapshot>
    where
        F: FnOnce(f64, i64) -> Fut,
        Fut: Future<Output = PlacementResult<()>>,
    {
        let mut node = self.lock_one(id).await?;
        let new_weight = max_weight.unwrap_or(node.max_weight);
        let new_count = max_count.unwrap_or(node.max_count);

        if new_weight + WEIGHT_EPSILON < node.occupied_weight + node.reserved_weight {
            return Err(PlacementError::InvalidRequest(format!(
                "max_weight {:.3} is below held weight {:.3}",
                new_weight,
                node.occupied_weight + node.reserved_weight
            )));
        }
        if node.kind == NodeKind::RackLevelSlot && new_count != 1 {
            return Err(PlacementError::InvalidRequest("a rack level slot always holds one stock".to_string()));
        }
        let floor = if node.kind.counts_stock() {
            (node.occupied_count + node.reserved_count).max(if node.kind == NodeKind::RackLevel {
                node.child_count
            } else {
                0
            })
        } else {
            node.child_count
        };
        if new_count < floor {
            return Err(PlacementError::InvalidRequest(format!(
                "{} {} is below current usage {}",
                node.kind.count_label(),
                new_count,
                floor
            )));
        }

        persist(new_weight, new_count).await?;
        node.max_weight = new_weight;
        node.max_count = new_count;
        Ok(node.snapshot())
    }

    pub async fn set_slot_active<F, Fut>(&self, id: &str, active: bool, persist: F) -> PlacementResult<NodeSnapshot>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PlacementResult<()>>,
    {
        let mut node = self.lock_one(id).await?;
        if node.kind != NodeKind::RackLevelSlot {
            return Err(PlacementError::InvalidRequest(format!(
                "only rack level slots can be (de)activated, '{}' is a {}",
                id, node.kind
            )));
        }
        if node.is_active != active {
            persist().await?;
            node.is_active = active;
        }
        Ok(node.snapshot())
    }
}

// ==================== HELPERS ====================

/// Same-stock releases pending on the node (a move within one subtree) count
/// as headroom; other operations' releases never do.
fn check_claim(node: &CapacityNode, weight: f64, count: i64, stock_id: &str) -> PlacementResult<()> {
    if node.kind == NodeKind::RackLevelSlot {
        if !node.is_active {
            return Err(PlacementError::SlotInactive(node.id.clone()));
        }
        if node.is_slot_taken() {
            return Err(PlacementError::SlotOccupied(node.id.clone()));
        }
    }
    let (credit_weight, credit_count) = node.release_credit(stock_id);
    let available_weight = node.available_weight() + credit_weight;
    if weight > available_weight + WEIGHT_EPSILON {
        return Err(PlacementError::capacity_exceeded(
            &node.id,
            node.kind,
            CapacityDimension::Weight,
            weight,
            available_weight,
        ));
    }
    let available_count = node.available_count() + credit_count;
    if node.kind.counts_stock() && available_count < count {
        return Err(PlacementError::capacity_exceeded(
            &node.id,
            node.kind,
            CapacityDimension::Count,
            count as f64,
            available_count as f64,
        ));
    }
    Ok(())
}

fn check_release(node: &CapacityNode, weight: f64, count: i64, stock_id: &str) -> PlacementResult<()> {
    if node.occupied_weight + WEIGHT_EPSILON < weight {
        return Err(PlacementError::Internal(format!(
            "{} '{}' holds {:.3}, cannot release {:.3}",
            node.kind, node.id, node.occupied_weight, weight
        )));
    }
    if node.kind.counts_stock() && node.occupied_count < count {
        return Err(PlacementError::Internal(format!(
            "{} '{}' holds {} stocks, cannot release {}",
            node.kind, node.id, node.occupied_count, count
        )));
    }
    if node.kind == NodeKind::RackLevelSlot && node.stock_id.as_deref() != Some(stock_id) {
        return Err(PlacementError::Conflict(format!(
            "slot '{}' does not hold stock '{}'",
            node.id, stock_id
        )));
    }
    Ok(())
}

/// Snaps float noise around zero back to zero.
fn settle(value: f64) -> f64 {
    if value.abs() < WEIGHT_EPSILON {
        0.0
    } else {
        value
    }
}

fn weights_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= WEIGHT_EPSILON * (1.0 + a.abs().max(b.abs()))
}

/// Recomputes occupied figures bottom-up from live stocks.
fn rebuild(nodes: Vec<CapacityNode>, stocks: &[Stock]) -> (HashMap<String, CapacityNode>, RebuildReport) {
    let mut report = RebuildReport {
        nodes: nodes.len(),
        ..Default::default()
    };
    let persisted: HashMap<String, (f64, i64)> = nodes
        .iter()
        .map(|n| (n.id.clone(), (n.occupied_weight, n.occupied_count)))
        .collect();

    let mut map: HashMap<String, CapacityNode> = nodes
        .into_iter()
        .map(|mut n| {
            n.occupied_weight = 0.0;
            n.occupied_count = 0;
            n.reserved_weight = 0.0;
            n.reserved_count = 0;
            n.weight_to_reserve = 0.0;
            n.child_count = 0;
            n.stock_id = None;
            (n.id.clone(), n)
        })
        .collect();

    let parents: Vec<String> = map.values().filter_map(|n| n.parent_id.clone()).collect();
    for parent_id in parents {
        if let Some(parent) = map.get_mut(&parent_id) {
            parent.child_count += 1;
            if !parent.kind.counts_stock() {
                parent.occupied_count += 1;
            }
        }
    }

    for stock in stocks.iter().filter(|s| !s.is_issued) {
        let Some(location) = stock.location.as_ref() else { continue };
        match map.get(location.node_id()) {
            Some(leaf) if leaf.kind == location.kind() => {}
            _ => {
                report.drift.push(format!("stock '{}' points at unknown location {}", stock.id, location));
                continue;
            }
        }
        report.stocks += 1;

        let mut current = Some(location.node_id().to_string());
        let mut depth = 0;
        while let Some(id) = current {
            let Some(node) = map.get_mut(&id) else { break };
            node.occupied_weight += stock.weight;
            if node.kind.counts_stock() {
                node.occupied_count += 1;
            }
            if node.kind == NodeKind::RackLevelSlot {
                node.stock_id = Some(stock.id.clone());
            }
            current = node.parent_id.clone();
            depth += 1;
            if depth > MAX_DEPTH {
                break;
            }
        }
    }

    for node in map.values() {
        if let Some((weight, count)) = persisted.get(&node.id) {
            if !weights_equal(*weight, node.occupied_weight) || *count != node.occupied_count {
                report.drift.push(format!(
                    "{} '{}': persisted ({:.3}, {}) != recomputed ({:.3}, {})",
                    node.kind, node.id, weight, count, node.occupied_weight, node.occupied_count
                ));
            }
        }
    }

    (map, report)
}

// ==================== TESTS ====================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::reservation::ReservationProtocol;
    use chrono::Utc;
    use tokio::time::sleep;

    async fn add(ledger: &CapacityLedger, id: &str, kind: NodeKind, parent: Option<&str>, weight: f64, count: i64) {
        let node = CapacityNode::new(id, kind, parent.map(str::to_string), id.to_uppercase(), weight, count);
        ledger.register(node, |_| async { Ok(()) }).await.unwrap();
    }

    /// W → S → R → L(100 kg, 4 slots) → s1..s4; W → WR(500 kg, 10 stocks).
    pub(crate) async fn fixture() -> CapacityLedger {
        let ledger = CapacityLedger::new(Duration::from_millis(200));
        add(&ledger, "w", NodeKind::Warehouse, None, 10_000.0, 10).await;
        add(&ledger, "sec", NodeKind::Section, Some("w"), 5_000.0, 10).await;
        add(&ledger, "rack", NodeKind::Rack, Some("sec"), 1_000.0, 5).await;
        add(&ledger, "lvl", NodeKind::RackLevel, Some("rack"), 100.0, 4).await;
        for slot in ["s1", "s2", "s3", "s4"] {
            add(&ledger, slot, NodeKind::RackLevelSlot, Some("lvl"), 100.0, 1).await;
        }
        add(&ledger, "wr", NodeKind::WaitingRoom, Some("w"), 500.0, 10).await;
        ledger
    }

    fn slot(id: &str) -> Location {
        Location::RackLevelSlot(id.to_string())
    }

    async fn place(ledger: &CapacityLedger, location: &Location, weight: f64, stock: &str) -> PlacementResult<()> {
        let path = ledger.resolve(location).await?;
        let token = ledger.reserve(&path, weight, 1, stock).await?;
        ledger.commit(vec![token]).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_paths() {
        let ledger = fixture().await;
        let path = ledger.resolve(&slot("s1")).await.unwrap();
        assert_eq!(path, vec!["s1", "lvl", "rack", "sec", "w"]);

        let path = ledger.resolve(&Location::WaitingRoom("wr".into())).await.unwrap();
        assert_eq!(path, vec!["wr", "w"]);

        assert!(matches!(
            ledger.resolve(&slot("lvl")).await,
            Err(PlacementError::InvalidLocation(_))
        ));
        assert!(matches!(
            ledger.resolve(&slot("nope")).await,
            Err(PlacementError::InvalidLocation(_))
        ));
    }

    #[tokio::test]
    async fn test_reserve_then_commit_moves_reserved_to_occupied() {
        let ledger = fixture().await;
        let path = ledger.resolve(&slot("s1")).await.unwrap();

        let token = ledger.reserve(&path, 30.0, 1, "stock-1").await.unwrap();
        let lvl = ledger.snapshot("lvl").await.unwrap();
        assert_eq!(lvl.reserved_weight, 30.0);
        assert_eq!(lvl.reserved_count, 1);
        assert_eq!(lvl.available_weight, 70.0);
        assert_eq!(lvl.occupied_weight, 0.0);

        ledger.commit(vec![token]).await;
        let lvl = ledger.snapshot("lvl").await.unwrap();
        assert_eq!(lvl.occupied_weight, 30.0);
        assert_eq!(lvl.available_weight, 70.0);
        assert_eq!(lvl.occupied_count, 1);
        assert_eq!(lvl.reserved_weight, 0.0);

        let s1 = ledger.snapshot("s1").await.unwrap();
        assert_eq!(s1.stock_id.as_deref(), Some("stock-1"));

        // Structural nodes count children, not stocks
        let rack = ledger.snapshot("rack").await.unwrap();
        assert_eq!(rack.occupied_weight, 30.0);
        assert_eq!(rack.occupied_count, 1);
        assert!(ledger.verify_invariants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_exceeded_names_level_and_changes_nothing() {
        let ledger = fixture().await;
        place(&ledger, &slot("s1"), 30.0, "stock-1").await.unwrap();

        let path = ledger.resolve(&slot("s2")).await.unwrap();
        let err = ledger.reserve(&path, 80.0, 1, "stock-2").await.unwrap_err();
        match err {
            PlacementError::CapacityExceeded { node_id, dimension, .. } => {
                assert_eq!(node_id, "lvl");
                assert_eq!(dimension, CapacityDimension::Weight);
            }
            other => panic!("unexpected error: {other}"),
        }

        for id in ["s2", "lvl", "rack", "sec", "w"] {
            let snap = ledger.snapshot(id).await.unwrap();
            assert_eq!(snap.reserved_weight, 0.0, "node {id}");
        }
        let lvl = ledger.snapshot("lvl").await.unwrap();
        assert_eq!(lvl.occupied_weight, 30.0);
        assert_eq!(lvl.occupied_count, 1);
    }

    #[tokio::test]
    async fn test_first_failing_node_is_leaf_first() {
        let ledger = fixture().await;
        ledger.resize("s4", Some(10.0), None, |_, _| async { Ok(()) }).await.unwrap();
        let path = ledger.resolve(&slot("s4")).await.unwrap();
        let err = ledger.reserve(&path, 500.0, 1, "big").await.unwrap_err();
        assert!(matches!(err, PlacementError::CapacityExceeded { ref node_id, .. } if node_id == "s4"));
    }

    #[tokio::test]
    async fn test_inactive_and_occupied_slots() {
        let ledger = fixture().await;
        ledger.set_slot_active("s3", false, || async { Ok(()) }).await.unwrap();
        let path = ledger.resolve(&slot("s3")).await.unwrap();
        assert!(matches!(
            ledger.reserve(&path, 1.0, 1, "x").await,
            Err(PlacementError::SlotInactive(_))
        ));

        place(&ledger, &slot("s1"), 5.0, "a").await.unwrap();
        let path = ledger.resolve(&slot("s1")).await.unwrap();
        assert!(matches!(
            ledger.reserve(&path, 1.0, 1, "b").await,
            Err(PlacementError::SlotOccupied(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_claim_blocks_slot() {
        let ledger = fixture().await;
        let path = ledger.resolve(&slot("s2")).await.unwrap();
        let token = ledger.reserve(&path, 5.0, 1, "a").await.unwrap();
        assert!(matches!(
            ledger.reserve(&path, 5.0, 1, "b").await,
            Err(PlacementError::SlotOccupied(_))
        ));
        ledger.release(vec![token]).await;
        assert!(ledger.reserve(&path, 5.0, 1, "b").await.is_ok());
    }

    #[tokio::test]
    async fn test_release_restores_counters() {
        let ledger = fixture().await;
        let path = ledger.resolve(&Location::WaitingRoom("wr".into())).await.unwrap();
        let token = ledger.reserve(&path, 120.0, 1, "a").await.unwrap();
        ledger.release(vec![token]).await;

        let wr = ledger.snapshot("wr").await.unwrap();
        assert_eq!(wr.reserved_weight, 0.0);
        assert_eq!(wr.reserved_count, 0);
        assert_eq!(wr.available_weight, 500.0);
    }

    #[tokio::test]
    async fn test_transfer_commits_both_legs_together() {
        let ledger = fixture().await;
        let wr = Location::WaitingRoom("wr".into());
        place(&ledger, &wr, 40.0, "a").await.unwrap();

        let source = ledger.resolve(&wr).await.unwrap();
        let dest = ledger.resolve(&slot("s2")).await.unwrap();
        let out = ledger.reserve(&source, -40.0, -1, "a").await.unwrap();
        let inbound = ledger.reserve(&dest, 40.0, 1, "a").await.unwrap();
        ledger.commit(vec![out, inbound]).await;

        assert_eq!(ledger.snapshot("wr").await.unwrap().occupied_weight, 0.0);
        assert_eq!(ledger.snapshot("s2").await.unwrap().occupied_weight, 40.0);
        // Warehouse sees the stock leave the waiting room and enter the section
        assert_eq!(ledger.snapshot("w").await.unwrap().occupied_weight, 40.0);
        assert!(ledger.verify_invariants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_move_within_full_level_uses_own_release() {
        let ledger = fixture().await;
        place(&ledger, &slot("s1"), 60.0, "a").await.unwrap();

        let source = ledger.resolve(&slot("s1")).await.unwrap();
        let dest = ledger.resolve(&slot("s2")).await.unwrap();
        let out = ledger.reserve(&source, -60.0, -1, "a").await.unwrap();

        // another stock cannot borrow the headroom being freed
        assert!(matches!(
            ledger.reserve(&dest, 60.0, 1, "b").await,
            Err(PlacementError::CapacityExceeded { .. })
        ));

        let inbound = ledger.reserve(&dest, 60.0, 1, "a").await.unwrap();
        assert!(ledger.verify_invariants().await.unwrap().is_empty());

        // in flight: shared ancestors net the claim against the release
        for id in ["lvl", "rack", "sec", "w"] {
            let snap = ledger.snapshot(id).await.unwrap();
            assert_eq!(snap.occupied_weight, 60.0, "node {id}");
            assert_eq!(snap.reserved_weight, 0.0, "node {id}");
            assert!(snap.occupied_weight + snap.reserved_weight <= snap.max_weight, "node {id}");
            assert!(snap.occupied_count + snap.reserved_count <= snap.max_count, "node {id}");
        }
        let lvl = ledger.snapshot("lvl").await.unwrap();
        assert_eq!(lvl.reserved_count, 0);
        assert_eq!(lvl.available_weight, 40.0);
        let s2 = ledger.snapshot("s2").await.unwrap();
        assert_eq!(s2.reserved_weight, 60.0);
        assert_eq!(s2.reserved_count, 1);

        ledger.commit(vec![out, inbound]).await;

        let lvl = ledger.snapshot("lvl").await.unwrap();
        assert_eq!(lvl.occupied_weight, 60.0);
        assert_eq!(lvl.occupied_count, 1);
        assert!(ledger.snapshot("s1").await.unwrap().stock_id.is_none());
        assert_eq!(ledger.snapshot("s2").await.unwrap().stock_id.as_deref(), Some("a"));
        assert!(ledger.verify_invariants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_released_transfer_leaves_no_trace() {
        let ledger = fixture().await;
        place(&ledger, &slot("s1"), 60.0, "a").await.unwrap();

        let source = ledger.resolve(&slot("s1")).await.unwrap();
        let dest = ledger.resolve(&slot("s2")).await.unwrap();
        let out = ledger.reserve(&source, -60.0, -1, "a").await.unwrap();
        let inbound = ledger.reserve(&dest, 60.0, 1, "a").await.unwrap();

        // a different stock still gets exactly the free headroom
        let path = ledger.resolve(&slot("s3")).await.unwrap();
        assert!(matches!(
            ledger.reserve(&path, 41.0, 1, "b").await,
            Err(PlacementError::CapacityExceeded { .. })
        ));

        ledger.release(vec![out, inbound]).await;
        for id in ["s2", "lvl", "rack", "w"] {
            let snap = ledger.snapshot(id).await.unwrap();
            assert_eq!(snap.reserved_weight, 0.0, "node {id}");
            assert_eq!(snap.reserved_count, 0, "node {id}");
        }
        assert_eq!(ledger.snapshot("lvl").await.unwrap().occupied_weight, 60.0);
        assert_eq!(ledger.snapshot("s1").await.unwrap().stock_id.as_deref(), Some("a"));

        // no credit is left behind for the stock
        assert!(matches!(
            ledger.reserve(&dest, 60.0, 1, "a").await,
            Err(PlacementError::CapacityExceeded { .. })
        ));
        assert!(ledger.verify_invariants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_protocol_commit_completes_after_caller_is_dropped() {
        let ledger = Arc::new(fixture().await);
        let path = ledger.resolve(&slot("s4")).await.unwrap();
        let mut protocol = ReservationProtocol::begin(ledger.clone(), "a", 20.0, None, Some(path))
            .await
            .unwrap();
        protocol.reserve_all().await.unwrap();

        let held = ledger.lock_one("lvl").await.unwrap();
        assert!(timeout(Duration::from_millis(20), protocol.commit()).await.is_err());
        drop(held);

        for _ in 0..50 {
            if ledger.snapshot("s4").await.unwrap().stock_id.is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let lvl = ledger.snapshot("lvl").await.unwrap();
        assert_eq!(lvl.reserved_weight, 0.0);
        assert_eq!(lvl.reserved_count, 0);
        assert_eq!(lvl.occupied_weight, 20.0);
        assert_eq!(lvl.occupied_count, 1);
        assert_eq!(ledger.snapshot("s4").await.unwrap().stock_id.as_deref(), Some("a"));
        assert!(ledger.verify_invariants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_leg_requires_held_stock() {
        let ledger = fixture().await;
        let path = ledger.resolve(&slot("s1")).await.unwrap();
        assert!(ledger.reserve(&path, -10.0, -1, "ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_stage_and_unstage() {
        let ledger = fixture().await;
        let path = ledger.resolve(&slot("s1")).await.unwrap();
        let intent = ledger.stage(&path, 25.0).await.unwrap();
        let lvl = ledger.snapshot("lvl").await.unwrap();
        assert_eq!(lvl.weight_to_reserve, 25.0);
        // requested-but-pending does not consume headroom
        assert_eq!(lvl.available_weight, 100.0);

        ledger.unstage(intent).await;
        assert_eq!(ledger.snapshot("lvl").await.unwrap().weight_to_reserve, 0.0);
    }

    #[tokio::test]
    async fn test_concurrent_claims_on_one_slot() {
        let ledger = Arc::new(fixture().await);
        let path = ledger.resolve(&slot("s1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let ledger = ledger.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                ledger.reserve(&path, 10.0, 1, &format!("stock-{i}")).await
            }));
        }

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(PlacementError::SlotOccupied(_)) | Err(PlacementError::CapacityExceeded { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn test_register_rejects_wrong_parent_and_overflow() {
        let ledger = fixture().await;
        let bad = CapacityNode::new("x", NodeKind::Rack, Some("w".into()), "X", 10.0, 1);
        assert!(matches!(
            ledger.register(bad, |_| async { Ok(()) }).await,
            Err(PlacementError::InvalidRequest(_))
        ));

        // lvl already has 4 of 4 slots
        let fifth = CapacityNode::new("s5", NodeKind::RackLevelSlot, Some("lvl".into()), "S5", 10.0, 1);
        assert!(matches!(
            ledger.register(fifth, |_| async { Ok(()) }).await,
            Err(PlacementError::CapacityExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_resize_cannot_shrink_below_usage() {
        let ledger = fixture().await;
        place(&ledger, &slot("s1"), 60.0, "a").await.unwrap();
        assert!(ledger.resize("lvl", Some(50.0), None, |_, _| async { Ok(()) }).await.is_err());
        assert!(ledger.resize("lvl", None, Some(3), |_, _| async { Ok(()) }).await.is_err());
        let snap = ledger.resize("lvl", Some(60.0), None, |_, _| async { Ok(()) }).await.unwrap();
        assert_eq!(snap.available_weight, 0.0);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_ledger_untouched() {
        let ledger = fixture().await;
        let result = ledger
            .resize("wr", Some(900.0), None, |_, _| async {
                Err(PlacementError::Internal("disk full".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(ledger.snapshot("wr").await.unwrap().max_weight, 500.0);
    }

    #[tokio::test]
    async fn test_load_rebuilds_from_stocks_and_reports_drift() {
        let mut nodes = Vec::new();
        let mut w = CapacityNode::new("w", NodeKind::Warehouse, None, "W", 1000.0, 5);
        w.occupied_weight = 99.0; // stale persisted figure
        nodes.push(w);
        nodes.push(CapacityNode::new("wr", NodeKind::WaitingRoom, Some("w".into()), "WR", 500.0, 10));

        let now = Utc::now();
        let stock = Stock {
            id: "st".into(),
            product_id: "p".into(),
            weight: 12.5,
            product_count: 3,
            location: Some(Location::WaitingRoom("wr".into())),
            is_issued: false,
            reception_id: "r".into(),
            issue_id: None,
            created_at: now,
            updated_at: now,
        };

        let ledger = CapacityLedger::new(Duration::from_millis(100));
        let report = ledger.load(nodes, &[stock]).await;
        assert_eq!(report.stocks, 1);
        assert!(report.drift.iter().any(|d| d.contains("warehouse 'w'")));

        let wr = ledger.snapshot("wr").await.unwrap();
        assert_eq!(wr.occupied_weight, 12.5);
        assert_eq!(wr.occupied_count, 1);
        let w = ledger.snapshot("w").await.unwrap();
        assert_eq!(w.occupied_weight, 12.5);
        assert_eq!(w.occupied_count, 1); // one child registered
        assert!(ledger.verify_invariants().await.unwrap().is_empty());
    }
}
