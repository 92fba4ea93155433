// src/actor.rs
//! Контекст вызывающего пользователя.
//!
//! Аутентификация выполняется шлюзом перед сервисом; сюда приходят уже
//! проверенные заголовки `X-User-Id` и `X-User-Capabilities`.

use actix_web::{dev::Payload, FromRequest, HttpRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::{ready, Ready};
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

use crate::error::{ApiError, PlacementError, PlacementResult};

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const CAPABILITIES_HEADER: &str = "X-User-Capabilities";

// ======== CAPABILITY ========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, EnumIter)]
pub enum Capability {
    #[strum(serialize = "can_move_stocks")]
    #[serde(rename = "can_move_stocks")]
    MoveStocks,
    #[strum(serialize = "can_recept_stocks")]
    #[serde(rename = "can_recept_stocks")]
    ReceptStocks,
    #[strum(serialize = "can_issue_stocks")]
    #[serde(rename = "can_issue_stocks")]
    IssueStocks,
    #[strum(serialize = "can_manage_locations")]
    #[serde(rename = "can_manage_locations")]
    ManageLocations,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(HashSet<Capability>);

impl Capabilities {
    pub fn all() -> Self {
        Self(Capability::iter().collect())
    }

    /// Parses a comma separated flag list. Unknown flags are skipped.
    pub fn parse(raw: &str) -> Self {
        let set = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| match Capability::from_str(s) {
                Ok(cap) => Some(cap),
                Err(_) => {
                    log::debug!("Ignoring unknown capability flag '{}'", s);
                    None
                }
            })
            .collect();
        Self(set)
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }
}

// ======== ACTOR CONTEXT ========

#[derive(Debug, Clone)]
pub struct ActorContext {
    pub user_id: String,
    pub capabilities: Capabilities,
}

impl ActorContext {
    pub fn new(user_id: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            user_id: user_id.into(),
            capabilities,
        }
    }

    pub fn require(&self, capability: Capability) -> PlacementResult<()> {
        if self.capabilities.contains(capability) {
            Ok(())
        } else {
            Err(PlacementError::NotPermitted(capability))
        }
    }
}

impl FromRequest for ActorContext {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(actor_from_request(req))
    }
}

fn actor_from_request(req: &HttpRequest) -> Result<ActorContext, ApiError> {
    let user_id = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Unauthorized(format!("Missing {} header", USER_ID_HEADER)))?;

    let capabilities = req
        .headers()
        .get(CAPABILITIES_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(Capabilities::parse)
        .unwrap_or_default();

    Ok(ActorContext::new(user_id, capabilities))
}
