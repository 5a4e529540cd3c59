use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::market::Outcome;
use super::order::OrderStatus;

/// Append-only audit entries for one order's state transitions. Each
/// variant carries exactly the fields a subscriber needs to update its
/// local view without a follow-up query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEventKind {
    Placed,
    Trade {
        trade_id: Uuid,
        price: Decimal,
        quantity: Decimal,
    },
    Cancel,
}

/// An event describing a change to one order, sequenced per-market so
/// subscribers can detect gaps (`sequence`/`lastSequence`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub market_id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub outcome: Outcome,
    pub status: OrderStatus,
    pub kind: OrderEventKind,
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
}
