// src/reservation.rs
//! Двухфазный протокол резервирования для одной операции размещения.
//!
//! Pending → SourceReserved → DestinationReserved → Committed,
//! либо Aborted в любой точке до Committed.

use std::sync::Arc;
use strum::{AsRefStr, Display};

use crate::error::{PlacementError, PlacementResult};
use crate::ledger::{CapacityLedger, NodePath, ReservationToken, StagedIntent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ProtocolState {
    Pending,
    SourceReserved,
    DestinationReserved,
    Committed,
    Aborted,
}

pub struct ReservationProtocol {
    ledger: Arc<CapacityLedger>,
    stock_id: String,
    weight: f64,
    source: Option<NodePath>,
    destination: Option<NodePath>,
    state: ProtocolState,
    staged: Option<StagedIntent>,
    tokens: Vec<ReservationToken>,
}

impl ReservationProtocol {
    /// Enters `Pending`, staging the requested weight on the destination path.
    pub async fn begin(
        ledger: Arc<CapacityLedger>,
        stock_id: &str,
        weight: f64,
        source: Option<NodePath>,
        destination: Option<NodePath>,
    ) -> PlacementResult<Self> {
        if !(weight.is_finite() && weight > 0.0) {
            return Err(PlacementError::InvalidRequest(format!("weight must be positive, got {}", weight)));
        }
        if source.is_none() && destination.is_none() {
            return Err(PlacementError::InvalidRequest(
                "an operation needs a source or a destination".to_string(),
            ));
        }

        let staged = match destination.as_deref() {
            Some(path) => Some(ledger.stage(path, weight).await?),
            None => None,
        };

        Ok(Self {
            ledger,
            stock_id: stock_id.to_string(),
            weight,
            source,
            destination,
            state: ProtocolState::Pending,
            staged,
            tokens: Vec::new(),
        })
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Reserves the release leg on the source path (if any).
    pub async fn reserve_source(&mut self) -> PlacementResult<()> {
        self.expect_state(ProtocolState::Pending)?;
        if let Some(path) = self.source.as_deref() {
            let token = self.ledger.reserve(path, -self.weight, -1, &self.stock_id).await?;
            self.tokens.push(token);
        }
        self.state = ProtocolState::SourceReserved;
        Ok(())
    }

    /// Reserves the claim leg on the destination path (if any). The staged
    /// intent is withdrawn either way: it is now accepted or rejected.
    pub async fn reserve_destination(&mut self) -> PlacementResult<()> {
        self.expect_state(ProtocolState::SourceReserved)?;
        if let Some(path) = self.destination.as_deref() {
            let result = self.ledger.reserve(path, self.weight, 1, &self.stock_id).await;
            if let Some(intent) = self.staged.take() {
                self.ledger.unstage(intent).await;
            }
            self.tokens.push(result?);
        }
        self.state = ProtocolState::DestinationReserved;
        Ok(())
    }

    /// Runs both reservation steps; on failure everything reserved so far is
    /// released and the protocol ends `Aborted`.
    pub async fn reserve_all(&mut self) -> PlacementResult<()> {
        let result = match self.reserve_source().await {
            Ok(()) => self.reserve_destination().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.abort_in_place().await;
            return Err(e);
        }
        Ok(())
    }

    /// Applies every reserved leg to the ledger. Must only be called after the
    /// persistence transaction committed.
    ///
    /// The ledger commit runs as its own task: once the write is durable it
    /// completes even if the caller's future is dropped while waiting for
    /// node locks.
    pub async fn commit(mut self) -> PlacementResult<()> {
        self.expect_state(ProtocolState::DestinationReserved)?;
        let tokens = std::mem::take(&mut self.tokens);
        self.state = ProtocolState::Committed;

        let ledger = self.ledger.clone();
        tokio::spawn(async move { ledger.commit(tokens).await })
            .await
            .map_err(|e| PlacementError::Internal(format!("ledger commit task failed: {}", e)))
    }

    pub async fn abort(mut self) {
        self.abort_in_place().await;
    }

    async fn abort_in_place(&mut self) {
        if let Some(intent) = self.staged.take() {
            self.ledger.unstage(intent).await;
        }
        let tokens = std::mem::take(&mut self.tokens);
        self.ledger.release(tokens).await;
        self.state = ProtocolState::Aborted;
    }

    fn expect_state(&self, expected: ProtocolState) -> PlacementResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PlacementError::Internal(format!(
                "reservation protocol for stock '{}' is {}, expected {}",
                self.stock_id, self.state, expected
            )))
        }
    }
}

impl Drop for ReservationProtocol {
    // Отменённый вызывающим future: освобождаем резервы в фоне
    fn drop(&mut self) {
        if matches!(self.state, ProtocolState::Committed | ProtocolState::Aborted) {
            return;
        }
        let tokens = std::mem::take(&mut self.tokens);
        let staged = self.staged.take();
        if tokens.is_empty() && staged.is_none() {
            return;
        }

        let ledger = self.ledger.clone();
        let stock_id = self.stock_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(intent) = staged {
                        ledger.unstage(intent).await;
                    }
                    ledger.release(tokens).await;
                    log::debug!("Released reservations of abandoned operation on stock {}", stock_id);
                });
            }
            Err(_) => log::error!(
                "Reservations for stock {} leaked: protocol dropped outside a runtime",
                stock_id
            ),
        }
    }
}
