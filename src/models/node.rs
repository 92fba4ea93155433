// src/models/node.rs
//! Узлы иерархии хранения и их счётчики ёмкости
//!
//! Warehouse → Section → Rack → RackLevel → RackLevelSlot,
//! плюс WaitingRoom (зона приёмки) непосредственно под Warehouse.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};
use validator::Validate;

lazy_static! {
    static ref NODE_CODE_REGEX: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").unwrap();
}

/// Допуск для сравнения весов (float)
pub const WEIGHT_EPSILON: f64 = 1e-6;

// ==================== NODE KIND ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeKind {
    Warehouse,
    Section,
    Rack,
    RackLevel,
    RackLevelSlot,
    WaitingRoom,
}

impl NodeKind {
    /// Тип родителя, под которым узел может быть зарегистрирован
    pub fn parent_kind(&self) -> Option<NodeKind> {
        match self {
            NodeKind::Warehouse => None,
            NodeKind::Section => Some(NodeKind::Warehouse),
            NodeKind::Rack => Some(NodeKind::Section),
            NodeKind::RackLevel => Some(NodeKind::Rack),
            NodeKind::RackLevelSlot => Some(NodeKind::RackLevel),
            NodeKind::WaitingRoom => Some(NodeKind::Warehouse),
        }
    }

    /// Leaves hold Stock directly.
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeKind::RackLevelSlot | NodeKind::WaitingRoom)
    }

    /// Count is the number of stocks held beneath the node. For the other
    /// kinds it is the number of registered child containers.
    pub fn counts_stock(&self) -> bool {
        matches!(
            self,
            NodeKind::RackLevelSlot | NodeKind::RackLevel | NodeKind::WaitingRoom
        )
    }

    /// Название лимита количества в терминах клиента
    pub fn count_label(&self) -> &'static str {
        match self {
            NodeKind::Warehouse => "max_children",
            NodeKind::Section => "max_racks",
            NodeKind::Rack => "max_levels",
            NodeKind::RackLevel => "max_slots",
            NodeKind::RackLevelSlot => "max_count",
            NodeKind::WaitingRoom => "max_stocks",
        }
    }
}

// ==================== CAPACITY NODE ====================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapacityNode {
    pub id: String,
    pub kind: NodeKind,
    pub parent_id: Option<String>,
    pub code: String,
    pub max_weight: f64,
    pub max_count: i64,
    pub occupied_weight: f64,
    pub occupied_count: i64,
    pub reserved_weight: f64,
    pub reserved_count: i64,
    /// Запрошено, но ещё не принято (стадия Pending протокола)
    pub weight_to_reserve: f64,
    pub child_count: i64,
    pub is_active: bool,
    pub stock_id: Option<String>,
    /// Принятые, но ещё не закоммиченные освобождения: stock_id → (вес, количество)
    #[serde(skip)]
    pub releasing: HashMap<String, (f64, i64)>,
    /// Часть заявки стока, зачтённая против его же освобождения на этом узле
    /// (перемещение внутри поддерева); в reserved_* не попадает
    #[serde(skip)]
    pub transfers: HashMap<String, (f64, i64)>,
}

impl CapacityNode {
    pub fn new(
        id: impl Into<String>,
        kind: NodeKind,
        parent_id: Option<String>,
        code: impl Into<String>,
        max_weight: f64,
        max_count: i64,
    ) -> Self {
        let max_count = if kind == NodeKind::RackLevelSlot { 1 } else { max_count };
        Self {
            id: id.into(),
            kind,
            parent_id,
            code: code.into(),
            max_weight,
            max_count,
            occupied_weight: 0.0,
            occupied_count: 0,
            reserved_weight: 0.0,
            reserved_count: 0,
            weight_to_reserve: 0.0,
            child_count: 0,
            is_active: true,
            stock_id: None,
            releasing: HashMap::new(),
            transfers: HashMap::new(),
        }
    }

    pub fn available_weight(&self) -> f64 {
        self.max_weight - self.occupied_weight - self.reserved_weight
    }

    pub fn available_count(&self) -> i64 {
        self.max_count - self.occupied_count - self.reserved_count
    }

    /// Headroom credit for a claim by a stock that is leaving this node in
    /// the same operation, minus what a claim already netted against it.
    pub fn release_credit(&self, stock_id: &str) -> (f64, i64) {
        let (weight, count) = self.releasing.get(stock_id).copied().unwrap_or((0.0, 0));
        let (used_weight, used_count) = self.transfers.get(stock_id).copied().unwrap_or((0.0, 0));
        ((weight - used_weight).max(0.0), (count - used_count).max(0))
    }

    /// Слот занят, если в нём лежит сток или на него уже есть принятая заявка
    pub fn is_slot_taken(&self) -> bool {
        self.stock_id.is_some() || self.reserved_count > 0
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        if self.occupied_weight < -WEIGHT_EPSILON
            || self.reserved_weight < -WEIGHT_EPSILON
            || self.weight_to_reserve < -WEIGHT_EPSILON
        {
            return Err(format!("{} '{}': negative weight figure", self.kind, self.id));
        }
        if self.occupied_count < 0 || self.reserved_count < 0 {
            return Err(format!("{} '{}': negative count figure", self.kind, self.id));
        }
        if self.occupied_weight + self.reserved_weight > self.max_weight + WEIGHT_EPSILON {
            return Err(format!(
                "{} '{}': occupied {:.3} + reserved {:.3} exceeds max_weight {:.3}",
                self.kind, self.id, self.occupied_weight, self.reserved_weight, self.max_weight
            ));
        }
        if self.occupied_count + self.reserved_count > self.max_count {
            return Err(format!(
                "{} '{}': occupied {} + reserved {} exceeds {} {}",
                self.kind,
                self.id,
                self.occupied_count,
                self.reserved_count,
                self.kind.count_label(),
                self.max_count
            ));
        }
        if self.kind == NodeKind::RackLevelSlot
            && self.stock_id.is_some() != (self.occupied_count == 1)
        {
            return Err(format!("rack_level_slot '{}': stock and count disagree", self.id));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            parent_id: self.parent_id.clone(),
            code: self.code.clone(),
            max_weight: self.max_weight,
            occupied_weight: self.occupied_weight,
            reserved_weight: self.reserved_weight,
            weight_to_reserve: self.weight_to_reserve,
            available_weight: self.available_weight().max(0.0),
            count_label: self.kind.count_label(),
            max_count: self.max_count,
            occupied_count: self.occupied_count,
            reserved_count: self.reserved_count,
            available_count: self.available_count().max(0),
            child_count: self.child_count,
            is_active: self.is_active,
            stock_id: self.stock_id.clone(),
        }
    }
}

/// Consistent read-only view of a node returned by `GET /nodes/{id}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NodeSnapshot {
    pub id: String,
    pub kind: NodeKind,
    pub parent_id: Option<String>,
    pub code: String,
    pub max_weight: f64,
    pub occupied_weight: f64,
    pub reserved_weight: f64,
    pub weight_to_reserve: f64,
    pub available_weight: f64,
    pub count_label: &'static str,
    pub max_count: i64,
    pub occupied_count: i64,
    pub reserved_count: i64,
    pub available_count: i64,
    pub child_count: i64,
    pub is_active: bool,
    pub stock_id: Option<String>,
}

// ==================== DB ROW ====================

#[derive(Debug, sqlx::FromRow)]
pub struct NodeRow {
    pub id: String,
    pub kind: String,
    pub parent_id: Option<String>,
    pub code: String,
    pub max_weight: f64,
    pub max_count: i64,
    pub occupied_weight: f64,
    pub occupied_count: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<NodeRow> for CapacityNode {
    type Error = String;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let kind = NodeKind::from_str(&row.kind)
            .map_err(|_| format!("Unknown node kind '{}' for node {}", row.kind, row.id))?;
        let mut node = CapacityNode::new(row.id, kind, row.parent_id, row.code, row.max_weight, row.max_count);
        node.occupied_weight = row.occupied_weight;
        node.occupied_count = row.occupied_count;
        node.is_active = row.is_active;
        Ok(node)
    }
}

// ==================== REQUESTS ====================

fn validate_node_code(code: &str) -> Result<(), validator::ValidationError> {
    if NODE_CODE_REGEX.is_match(code) {
        Ok(())
    } else {
        Err(validator::ValidationError::new("invalid_node_code"))
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateNodeRequest {
    pub kind: NodeKind,

    pub parent_id: Option<String>,

    #[validate(custom(function = "validate_node_code"))]
    pub code: String,

    #[validate(range(min = 0.001, message = "max_weight must be positive"))]
    pub max_weight: f64,

    /// Ignored for rack level slots (always 1).
    #[validate(range(min = 0, max = 100000, message = "max_count must be between 0 and 100000"))]
    #[serde(default)]
    pub max_count: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResizeNodeRequest {
    #[validate(range(min = 0.001, message = "max_weight must be positive"))]
    pub max_weight: Option<f64>,

    #[validate(range(min = 0, max = 100000, message = "max_count must be between 0 and 100000"))]
    pub max_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SetSlotActiveRequest {
    pub is_active: bool,
}
