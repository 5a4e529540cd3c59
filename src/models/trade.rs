use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::market::Outcome;
use super::order::Side;

/// A single fill produced by the matching engine.
///
/// `price` is the maker's resting price (price-time priority means the
/// maker always sets the execution price). `taker_side` records which side
/// crossed the book, since both sides of a fill reference the same trade
/// row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trade {
    pub id: Uuid,
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub maker_order_id: Uuid,
    pub taker_order_id: Uuid,
    pub maker_user_id: Uuid,
    pub taker_user_id: Uuid,
    pub taker_side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub sequence: i64,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResponse {
    pub id: Uuid,
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub price: Decimal,
    pub quantity: Decimal,
    pub taker_side: Side,
    pub executed_at: DateTime<Utc>,
}

impl From<Trade> for TradeResponse {
    fn from(t: Trade) -> Self {
        Self {
            id: t.id,
            market_id: t.market_id,
            outcome: t.outcome,
            price: t.price,
            quantity: t.quantity,
            taker_side: t.taker_side,
            executed_at: t.executed_at,
        }
    }
}
