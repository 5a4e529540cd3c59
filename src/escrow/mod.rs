//! C3 EscrowLedger: the single durable transaction per submission.
//!
//! One `pool.begin()` transaction performs every balance/position/share
//! mutation for an operation, synchronous with matching rather than
//! fire-and-forget: a ledger failure must leave the book untouched. Exposed
//! as a [`Ledger`] trait so the engine's core logic can be tested with
//! [`InMemoryLedger`] instead of a live Postgres, keeping pure in-memory
//! matching and async persistence cleanly split.

mod in_memory;
mod sqlx_ledger;

pub use in_memory::InMemoryLedger;
pub use sqlx_ledger::SqlxLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::engine::Fill;
use crate::models::balance::Balance;
use crate::models::market::Outcome;
use crate::models::order::{Order, OrderType, Side, TimeInForce};
use crate::models::position::Position;
use crate::models::trade::Trade;

#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    #[error("market is not open")]
    MarketNotOpen,
    #[error("insufficient available balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Decimal, available: Decimal },
    #[error("insufficient free shares: need {needed}, have {available}")]
    InsufficientShares { needed: Decimal, available: Decimal },
    #[error("position cap exceeded: cap {cap}, attempted total {attempted}")]
    PositionCapExceeded { cap: Decimal, attempted: Decimal },
    #[error("order not found")]
    NotFound,
    #[error("caller does not own this order")]
    NotOwner,
    #[error("order already terminal")]
    AlreadyTerminal,
    #[error("internal escrow failure: {0}")]
    Internal(String),
}

/// Everything the ledger needs to commit one accepted submission: the new
/// order's identity plus the candidate fill set the Engine already computed
/// against an immutable view of the Book. Nothing here has touched the Book
/// yet.
#[derive(Debug, Clone)]
pub struct SubmissionInput {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub idempotency_key: Option<String>,
    /// `Some` for LIMIT orders; `None` for MARKET (reservation uses the
    /// configured reference price instead).
    pub limit_price: Option<Decimal>,
    pub reference_price: Decimal,
    pub quantity: Decimal,
    pub created_at: DateTime<Utc>,
    pub fills: Vec<Fill>,
    pub incoming_filled: Decimal,
    pub incoming_remaining: Decimal,
    /// `true` if the Engine determined the residual is cancelled rather
    /// than resting (MARKET residual, or a collar-halted walk).
    pub residual_cancelled: bool,
    /// Cap on this user's total |shares| across both outcomes of the
    /// market, checked on BUY submissions only. `None` means no cap.
    pub position_cap: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct SubmissionCommit {
    pub order: Order,
    pub trades: Vec<Trade>,
    pub taker_balance: Balance,
    pub taker_position: Option<Position>,
    /// One `Trade` variant per side of each fill, in the same durable
    /// transaction as the fill itself.
    pub order_events: Vec<crate::models::order_event::OrderEvent>,
}

#[derive(Debug, Clone)]
pub struct CancellationCommit {
    pub balance: Option<Balance>,
    pub side: Side,
    pub price: Option<Decimal>,
    pub order_event: crate::models::order_event::OrderEvent,
}

/// Per-outcome payout row produced by settlement, returned so the caller
/// can emit `position_updated` events without a re-query.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SettledPosition {
    pub user_id: Uuid,
    pub outcome: Outcome,
    pub payout: Decimal,
    pub won: bool,
}

#[derive(Debug, Clone)]
pub struct SettlementCommit {
    pub settled: Vec<SettledPosition>,
    pub total_payout: Decimal,
}

/// The atomic-transaction contract of C3. Every method commits exactly one
/// durable transaction or leaves no trace of partial work: any exception
/// within the transaction aborts the whole submission.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Escrows, matches, and records the submission described by `input`.
    /// Order and trade rows, balance and position updates, and
    /// `OrderEvent`s are all written in one transaction.
    async fn submit_order(&self, input: SubmissionInput) -> Result<SubmissionCommit, EscrowError>;

    /// Cancels an OPEN/PARTIAL order and releases its residual escrow.
    /// A no-op success (not an error) if the order has just become FILLED
    /// concurrently.
    async fn cancel_order(&self, order_id: Uuid, user_id: Uuid) -> Result<CancellationCommit, EscrowError>;

    /// Resolves a market to `outcome`: pays winning positions 1/share,
    /// zeroes losing positions, cancels any still-open orders.
    async fn resolve_market(&self, market_id: Uuid, outcome: Outcome) -> Result<SettlementCommit, EscrowError>;

    /// Cancels a market: refunds every position at its `avg_cost` and
    /// releases all open-order escrow.
    async fn cancel_market(&self, market_id: Uuid) -> Result<SettlementCommit, EscrowError>;

    async fn get_balance(&self, user_id: Uuid) -> Result<Balance, EscrowError>;
    async fn get_position(&self, user_id: Uuid, market_id: Uuid, outcome: Outcome) -> Result<Position, EscrowError>;

    /// Most recent trades for a market, descending by sequence (newest
    /// first), capped at `limit`.
    async fn recent_trades(&self, market_id: Uuid, limit: i64) -> Result<Vec<Trade>, EscrowError>;
}
