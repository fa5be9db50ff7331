//! Boundary collaborators the decision core talks to.
//!
//! Broker connectivity, market-data transport and the AI oracle live outside
//! this crate; only their contracts are defined here, plus null/paper
//! implementations for dry runs and tests.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::logging::{log, obj, v_str, Domain, Level};
use crate::market::StreamKind;

pub mod ai_http;
pub mod types;

pub use types::*;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AiError {
    #[error("ai scorer timed out")]
    Timeout,
    #[error("transient ai scorer failure: {0}")]
    Transient(String),
    #[error("ai scorer unavailable: {0}")]
    Permanent(String),
}

impl AiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AiError::Timeout | AiError::Transient(_))
    }
}

/// Live market-data transport. Calls are queued sends on the transport's
/// socket and must not block.
pub trait MarketFeed: Send + Sync {
    fn subscribe(&self, instrument_id: &str, kind: StreamKind) -> Result<()>;
    fn unsubscribe(&self, instrument_id: &str, kind: StreamKind) -> Result<()>;
}

#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck>;
    /// Withdraw the unfilled remainder of an order.
    async fn cancel_order(&self, order_id: &str) -> Result<()>;
}

#[async_trait]
pub trait AiScorer: Send + Sync {
    async fn score(&self, summary: &CandidateSummary) -> Result<AiVerdict, AiError>;
}

#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Realized returns (percent) of past setups similar to `query`.
    async fn similar_setups(&self, query: &SetupQuery) -> Result<Vec<f64>>;
}

// =============================================================================
// Null / paper implementations
// =============================================================================

pub struct NullFeed;

impl MarketFeed for NullFeed {
    fn subscribe(&self, instrument_id: &str, kind: StreamKind) -> Result<()> {
        log(
            Level::Trace,
            Domain::Slots,
            "feed_subscribe",
            obj(&[("instrument_id", v_str(instrument_id)), ("stream", v_str(kind.as_str()))]),
        );
        Ok(())
    }

    fn unsubscribe(&self, instrument_id: &str, kind: StreamKind) -> Result<()> {
        log(
            Level::Trace,
            Domain::Slots,
            "feed_unsubscribe",
            obj(&[("instrument_id", v_str(instrument_id)), ("stream", v_str(kind.as_str()))]),
        );
        Ok(())
    }
}

/// Used when no scorer endpoint is configured; every candidate degrades to HOLD.
pub struct NullScorer;

#[async_trait]
impl AiScorer for NullScorer {
    async fn score(&self, _summary: &CandidateSummary) -> Result<AiVerdict, AiError> {
        Err(AiError::Permanent("no scorer configured".to_string()))
    }
}

pub struct EmptyHistory;

#[async_trait]
impl HistoryProvider for EmptyHistory {
    async fn similar_setups(&self, _query: &SetupQuery) -> Result<Vec<f64>> {
        Ok(Vec::new())
    }
}

/// Acknowledges every order and reports an immediate full fill at the
/// request price on the fill channel.
pub struct PaperExecutor {
    fills: mpsc::UnboundedSender<FillEvent>,
    seq: AtomicU64,
}

impl PaperExecutor {
    pub fn new(fills: mpsc::UnboundedSender<FillEvent>) -> Self {
        Self { fills, seq: AtomicU64::new(0) }
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck> {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let order_id = format!("paper-{}-{}", req.client_id, n);
        let price = req
            .price
            .ok_or_else(|| anyhow::anyhow!("paper fill needs a reference price"))?;
        let fill = FillEvent {
            order_id: order_id.clone(),
            instrument_id: req.instrument_id.clone(),
            side: req.side,
            price,
            qty: req.qty,
            ts: crate::config::now_ts(),
        };
        self.fills
            .send(fill)
            .map_err(|_| anyhow::anyhow!("fill channel closed"))?;
        Ok(OrderAck { order_id, status: "FILLED".to_string() })
    }

    /// Paper orders fill on placement; nothing is ever left to cancel.
    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        log(Level::Trace, Domain::Exec, "paper_cancel", obj(&[("order_id", v_str(order_id))]));
        Ok(())
    }
}
