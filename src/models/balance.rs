use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A user's cash balance in the single settlement currency.
///
/// `available` is spendable; `locked` is cash reserved as escrow against
/// open BUY orders. `available + locked` only changes on deposit, fee or
/// settlement events, never on order placement.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Balance {
    pub user_id: Uuid,
    pub available: Decimal,
    pub locked: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub available: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
}

impl From<Balance> for BalanceResponse {
    fn from(balance: Balance) -> Self {
        let total = balance.total();
        Self {
            available: balance.available,
            locked: balance.locked,
            total,
        }
    }
}
