use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::market::Outcome;

/// A user's share holding in one outcome of one market.
///
/// `avg_cost` is the volume-weighted average price paid per share, tracked
/// for informational display and for `Cancellation` settlement refunds;
/// it is not used by the matching engine itself.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Position {
    pub user_id: Uuid,
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn is_empty(&self) -> bool {
        self.quantity == Decimal::ZERO
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionResponse {
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub quantity: Decimal,
    pub avg_cost: Decimal,
}

impl From<Position> for PositionResponse {
    fn from(p: Position) -> Self {
        Self {
            market_id: p.market_id,
            outcome: p.outcome,
            quantity: p.quantity,
            avg_cost: p.avg_cost,
        }
    }
}
