//! Postgres-backed [`Ledger`]: one `pool.begin()` per operation, rows
//! locked `FOR UPDATE`, committed only once every row in the operation has
//! been written.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use super::in_memory::round_fill_cost;

use super::{
    CancellationCommit, EscrowError, Ledger, SettledPosition, SettlementCommit, SubmissionCommit, SubmissionInput,
};
use crate::models::balance::Balance;
use crate::models::market::Outcome;
use crate::models::order::{Order, OrderStatus, Side};
use crate::models::order_event::{OrderEvent, OrderEventKind};
use crate::models::position::Position;
use crate::models::trade::Trade;

impl From<sqlx::Error> for EscrowError {
    fn from(err: sqlx::Error) -> Self {
        EscrowError::Internal(err.to_string())
    }
}

pub struct SqlxLedger {
    pool: PgPool,
}

impl SqlxLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upserts a zero balance if absent, then locks the row so concurrent
    /// submissions touching the same user across different markets
    /// serialize on it.
    async fn load_balance_for_update(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: Uuid,
    ) -> Result<Balance, EscrowError> {
        sqlx::query("INSERT INTO balances (user_id, available, locked, updated_at) VALUES ($1, 0, 0, now()) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query_as::<_, Balance>(
            "SELECT user_id, available, locked, updated_at FROM balances WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(EscrowError::from)
    }

    async fn load_position_for_update(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: Uuid,
        market_id: Uuid,
        outcome: Outcome,
    ) -> Result<Position, EscrowError> {
        sqlx::query_as::<_, Position>(
            r#"
            INSERT INTO positions (user_id, market_id, outcome, quantity, avg_cost, updated_at)
            VALUES ($1, $2, $3, 0, 0, now())
            ON CONFLICT (user_id, market_id, outcome) DO UPDATE SET user_id = EXCLUDED.user_id
            RETURNING user_id, market_id, outcome, quantity, avg_cost, updated_at
            "#,
        )
        .bind(user_id)
        .bind(market_id)
        .bind(outcome)
        .fetch_one(&mut **tx)
        .await
        .map_err(EscrowError::from)
    }

    /// Next per-market sequence for `order_events`. Safe without a row lock:
    /// `MarketActor`'s own mutex already serializes every submission and
    /// cancellation for this market, so there is never a second writer in
    /// flight, and a transaction sees its own uncommitted inserts.
    async fn next_order_event_sequence(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        market_id: Uuid,
    ) -> Result<i64, EscrowError> {
        let (seq,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(sequence), 0) + 1 FROM order_events WHERE market_id = $1")
                .bind(market_id)
                .fetch_one(&mut **tx)
                .await?;
        Ok(seq)
    }

    async fn insert_order_event(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &OrderEvent,
    ) -> Result<(), EscrowError> {
        let (kind, trade_id, price, quantity) = match &event.kind {
            OrderEventKind::Placed => ("PLACED", None, None, None),
            OrderEventKind::Trade { trade_id, price, quantity } => ("TRADE", Some(*trade_id), Some(*price), Some(*quantity)),
            OrderEventKind::Cancel => ("CANCEL", None, None, None),
        };
        sqlx::query(
            r#"
            INSERT INTO order_events (market_id, order_id, user_id, outcome, status, kind, trade_id, price, quantity, sequence, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.market_id)
        .bind(event.order_id)
        .bind(event.user_id)
        .bind(event.outcome)
        .bind(event.status)
        .bind(kind)
        .bind(trade_id)
        .bind(price)
        .bind(quantity)
        .bind(event.sequence as i64)
        .bind(event.occurred_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Ledger for SqlxLedger {
    async fn submit_order(&self, input: SubmissionInput) -> Result<SubmissionCommit, EscrowError> {
        let mut tx = self.pool.begin().await?;

        let reservation_price = input.limit_price.unwrap_or(input.reference_price);
        let reserved = input.quantity * reservation_price;

        match input.side {
            Side::Buy => {
                if let Some(cap) = input.position_cap {
                    let (total,): (Option<Decimal>,) = sqlx::query_as(
                        "SELECT SUM(quantity) FROM positions WHERE user_id = $1 AND market_id = $2",
                    )
                    .bind(input.user_id)
                    .bind(input.market_id)
                    .fetch_one(&mut *tx)
                    .await?;
                    let projected = total.unwrap_or(Decimal::ZERO) + input.quantity;
                    if projected > cap {
                        return Err(EscrowError::PositionCapExceeded { cap, attempted: projected });
                    }
                }

                let mut balance = Self::load_balance_for_update(&mut tx, input.user_id).await?;
                if balance.available < reserved {
                    return Err(EscrowError::InsufficientBalance {
                        needed: reserved,
                        available: balance.available,
                    });
                }
                balance.available -= reserved;
                balance.locked += reserved;
                sqlx::query("UPDATE balances SET available = $1, locked = $2, updated_at = now() WHERE user_id = $3")
                    .bind(balance.available)
                    .bind(balance.locked)
                    .bind(input.user_id)
                    .execute(&mut *tx)
                    .await?;
            }
            Side::Sell => {
                let position = Self::load_position_for_update(&mut tx, input.user_id, input.market_id, input.outcome).await?;
                let reserved_by_open_sells: (Option<Decimal>,) = sqlx::query_as(
                    r#"
                    SELECT SUM(quantity - filled_quantity)
                    FROM orders
                    WHERE user_id = $1 AND market_id = $2 AND outcome = $3 AND side = 'sell'
                      AND status NOT IN ('filled', 'cancelled')
                    "#,
                )
                .bind(input.user_id)
                .bind(input.market_id)
                .bind(input.outcome)
                .fetch_one(&mut *tx)
                .await?;
                let free = position.quantity - reserved_by_open_sells.0.unwrap_or(Decimal::ZERO);
                if free < input.quantity {
                    return Err(EscrowError::InsufficientShares {
                        needed: input.quantity,
                        available: free,
                    });
                }
            }
        }

        let residual_rests =
            input.limit_price.is_some() && !input.residual_cancelled && input.incoming_remaining > Decimal::ZERO;
        let status = if input.incoming_remaining <= Decimal::ZERO {
            OrderStatus::Filled
        } else if input.residual_cancelled {
            OrderStatus::Cancelled
        } else if input.incoming_filled > Decimal::ZERO {
            OrderStatus::Partial
        } else {
            OrderStatus::Open
        };

        let mut trades = Vec::with_capacity(input.fills.len());
        let mut order_events = Vec::with_capacity(input.fills.len() * 2);
        let mut consumed_cost = Decimal::ZERO;

        for fill in &input.fills {
            let (buyer, seller) = match input.side {
                Side::Buy => (input.user_id, fill.maker_user_id),
                Side::Sell => (fill.maker_user_id, input.user_id),
            };
            let exec_price = fill.maker_price;
            let qty = fill.quantity;
            let fill_cost = round_fill_cost(qty * exec_price);
            if input.side == Side::Buy {
                consumed_cost += fill_cost;
            }

            let buyer_position = Self::load_position_for_update(&mut tx, buyer, input.market_id, input.outcome).await?;
            let new_qty = buyer_position.quantity + qty;
            let new_avg = if new_qty.is_zero() {
                Decimal::ZERO
            } else {
                (buyer_position.quantity * buyer_position.avg_cost + fill_cost) / new_qty
            };
            sqlx::query(
                "UPDATE positions SET quantity = $1, avg_cost = $2, updated_at = now() WHERE user_id = $3 AND market_id = $4 AND outcome = $5",
            )
            .bind(new_qty)
            .bind(new_avg)
            .bind(buyer)
            .bind(input.market_id)
            .bind(input.outcome)
            .execute(&mut *tx)
            .await?;

            if input.side == Side::Buy {
                sqlx::query("UPDATE balances SET locked = locked - $1, updated_at = now() WHERE user_id = $2")
                    .bind(fill_cost)
                    .bind(buyer)
                    .execute(&mut *tx)
                    .await?;
            }

            let seller_position = Self::load_position_for_update(&mut tx, seller, input.market_id, input.outcome).await?;
            sqlx::query(
                "UPDATE positions SET quantity = $1, updated_at = now() WHERE user_id = $2 AND market_id = $3 AND outcome = $4",
            )
            .bind(seller_position.quantity - qty)
            .bind(seller)
            .bind(input.market_id)
            .bind(input.outcome)
            .execute(&mut *tx)
            .await?;
            sqlx::query("UPDATE balances SET available = available + $1, updated_at = now() WHERE user_id = $2")
                .bind(fill_cost)
                .bind(seller)
                .execute(&mut *tx)
                .await?;

            let maker_status = if fill.maker_fully_filled {
                OrderStatus::Filled
            } else {
                OrderStatus::Partial
            };
            sqlx::query(
                "UPDATE orders SET filled_quantity = filled_quantity + $1, status = $2, updated_at = now() WHERE id = $3",
            )
            .bind(qty)
            .bind(maker_status)
            .bind(fill.maker_order_id)
            .execute(&mut *tx)
            .await?;

            let mut trade = Trade {
                id: crate::ids::new_id(),
                market_id: input.market_id,
                outcome: input.outcome,
                maker_order_id: fill.maker_order_id,
                taker_order_id: input.order_id,
                maker_user_id: fill.maker_user_id,
                taker_user_id: input.user_id,
                taker_side: input.side,
                price: exec_price,
                quantity: qty,
                sequence: 0,
                executed_at: Utc::now(),
            };
            let (sequence,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO trades (id, market_id, outcome, maker_order_id, taker_order_id, maker_user_id, taker_user_id, taker_side, price, quantity, sequence, executed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, nextval('trade_sequence'), $11)
                RETURNING sequence
                "#,
            )
            .bind(trade.id)
            .bind(trade.market_id)
            .bind(trade.outcome)
            .bind(trade.maker_order_id)
            .bind(trade.taker_order_id)
            .bind(trade.maker_user_id)
            .bind(trade.taker_user_id)
            .bind(trade.taker_side)
            .bind(trade.price)
            .bind(trade.quantity)
            .bind(trade.executed_at)
            .fetch_one(&mut *tx)
            .await?;
            trade.sequence = sequence;

            let taker_sequence = Self::next_order_event_sequence(&mut tx, input.market_id).await?;
            let taker_event = OrderEvent {
                market_id: input.market_id,
                order_id: input.order_id,
                user_id: input.user_id,
                outcome: input.outcome,
                status,
                kind: OrderEventKind::Trade {
                    trade_id: trade.id,
                    price: trade.price,
                    quantity: trade.quantity,
                },
                sequence: taker_sequence as u64,
                occurred_at: trade.executed_at,
            };
            Self::insert_order_event(&mut tx, &taker_event).await?;
            order_events.push(taker_event);

            let maker_sequence = Self::next_order_event_sequence(&mut tx, input.market_id).await?;
            let maker_event = OrderEvent {
                market_id: input.market_id,
                order_id: fill.maker_order_id,
                user_id: fill.maker_user_id,
                outcome: input.outcome,
                status: maker_status,
                kind: OrderEventKind::Trade {
                    trade_id: trade.id,
                    price: trade.price,
                    quantity: trade.quantity,
                },
                sequence: maker_sequence as u64,
                occurred_at: trade.executed_at,
            };
            Self::insert_order_event(&mut tx, &maker_event).await?;
            order_events.push(maker_event);

            trades.push(trade);
        }

        if input.side == Side::Buy {
            let residual_lock_target = if residual_rests {
                input.incoming_remaining * input.limit_price.expect("checked above")
            } else {
                Decimal::ZERO
            };
            let refund = reserved - consumed_cost - residual_lock_target;
            sqlx::query("UPDATE balances SET available = available + $1, locked = locked - $1, updated_at = now() WHERE user_id = $2")
                .bind(refund)
                .bind(input.user_id)
                .execute(&mut *tx)
                .await?;
        }

        let order = Order {
            id: input.order_id,
            user_id: input.user_id,
            market_id: input.market_id,
            outcome: input.outcome,
            side: input.side,
            order_type: input.order_type,
            time_in_force: input.time_in_force,
            price: input.limit_price,
            quantity: input.quantity,
            filled_quantity: input.incoming_filled,
            status,
            idempotency_key: input.idempotency_key,
            created_at: input.created_at,
            updated_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, market_id, outcome, side, order_type, time_in_force, price, quantity, filled_quantity, status, idempotency_key, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(order.id)
        .bind(order.user_id)
        .bind(order.market_id)
        .bind(order.outcome)
        .bind(order.side)
        .bind(order.order_type)
        .bind(order.time_in_force)
        .bind(order.price)
        .bind(order.quantity)
        .bind(order.filled_quantity)
        .bind(order.status)
        .bind(&order.idempotency_key)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await?;

        let taker_balance = sqlx::query_as::<_, Balance>(
            "SELECT user_id, available, locked, updated_at FROM balances WHERE user_id = $1",
        )
        .bind(input.user_id)
        .fetch_one(&mut *tx)
        .await?;
        let taker_position = sqlx::query_as::<_, Position>(
            "SELECT user_id, market_id, outcome, quantity, avg_cost, updated_at FROM positions WHERE user_id = $1 AND market_id = $2 AND outcome = $3",
        )
        .bind(input.user_id)
        .bind(input.market_id)
        .bind(input.outcome)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(SubmissionCommit {
            order,
            trades,
            taker_balance,
            taker_position,
            order_events,
        })
    }

    async fn cancel_order(&self, order_id: Uuid, user_id: Uuid) -> Result<CancellationCommit, EscrowError> {
        let mut tx = self.pool.begin().await?;
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(EscrowError::NotFound)?;
        if order.user_id != user_id {
            return Err(EscrowError::NotOwner);
        }
        if order.status.is_terminal() {
            return Err(EscrowError::AlreadyTerminal);
        }

        let (side, price) = (order.side, order.price);
        let balance = if order.side == Side::Buy {
            let price = order.price.expect("BUY orders always carry a limit or reservation price");
            let released = order.remaining() * price;
            let balance = sqlx::query_as::<_, Balance>(
                r#"
                UPDATE balances SET available = available + $1, locked = locked - $1, updated_at = now()
                WHERE user_id = $2
                RETURNING user_id, available, locked, updated_at
                "#,
            )
            .bind(released)
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
            Some(balance)
        } else {
            None
        };

        sqlx::query("UPDATE orders SET status = 'cancelled', updated_at = now() WHERE id = $1")
            .bind(order_id)
            .execute(&mut *tx)
            .await?;

        let sequence = Self::next_order_event_sequence(&mut tx, order.market_id).await?;
        let order_event = OrderEvent {
            market_id: order.market_id,
            order_id,
            user_id,
            outcome: order.outcome,
            status: OrderStatus::Cancelled,
            kind: OrderEventKind::Cancel,
            sequence: sequence as u64,
            occurred_at: Utc::now(),
        };
        Self::insert_order_event(&mut tx, &order_event).await?;

        tx.commit().await?;
        Ok(CancellationCommit { balance, side, price, order_event })
    }

    async fn resolve_market(&self, market_id: Uuid, outcome: Outcome) -> Result<SettlementCommit, EscrowError> {
        let mut tx = self.pool.begin().await?;
        release_open_orders(&mut tx, market_id).await?;

        let positions = sqlx::query_as::<_, Position>(
            "SELECT user_id, market_id, outcome, quantity, avg_cost, updated_at FROM positions WHERE market_id = $1 AND quantity > 0 FOR UPDATE",
        )
        .bind(market_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut settled = Vec::new();
        let mut total_payout = Decimal::ZERO;
        for position in positions {
            let won = position.outcome == outcome;
            let payout = if won { position.quantity } else { Decimal::ZERO };
            if payout > Decimal::ZERO {
                sqlx::query("UPDATE balances SET available = available + $1, updated_at = now() WHERE user_id = $2")
                    .bind(payout)
                    .bind(position.user_id)
                    .execute(&mut *tx)
                    .await?;
                total_payout += payout;
            }
            sqlx::query(
                "UPDATE positions SET quantity = 0, updated_at = now() WHERE user_id = $1 AND market_id = $2 AND outcome = $3",
            )
            .bind(position.user_id)
            .bind(market_id)
            .bind(position.outcome)
            .execute(&mut *tx)
            .await?;
            settled.push(SettledPosition {
                user_id: position.user_id,
                outcome: position.outcome,
                payout,
                won,
            });
        }

        tx.commit().await?;
        Ok(SettlementCommit { settled, total_payout })
    }

    async fn cancel_market(&self, market_id: Uuid) -> Result<SettlementCommit, EscrowError> {
        let mut tx = self.pool.begin().await?;
        release_open_orders(&mut tx, market_id).await?;

        let positions = sqlx::query_as::<_, Position>(
            "SELECT user_id, market_id, outcome, quantity, avg_cost, updated_at FROM positions WHERE market_id = $1 AND quantity > 0 FOR UPDATE",
        )
        .bind(market_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut settled = Vec::new();
        let mut total_payout = Decimal::ZERO;
        for position in positions {
            let refund = position.quantity * position.avg_cost;
            sqlx::query("UPDATE balances SET available = available + $1, updated_at = now() WHERE user_id = $2")
                .bind(refund)
                .bind(position.user_id)
                .execute(&mut *tx)
                .await?;
            total_payout += refund;
            sqlx::query(
                "UPDATE positions SET quantity = 0, updated_at = now() WHERE user_id = $1 AND market_id = $2 AND outcome = $3",
            )
            .bind(position.user_id)
            .bind(market_id)
            .bind(position.outcome)
            .execute(&mut *tx)
            .await?;
            settled.push(SettledPosition {
                user_id: position.user_id,
                outcome: position.outcome,
                payout: refund,
                won: false,
            });
        }

        tx.commit().await?;
        Ok(SettlementCommit { settled, total_payout })
    }

    async fn get_balance(&self, user_id: Uuid) -> Result<Balance, EscrowError> {
        let balance = sqlx::query_as::<_, Balance>(
            "SELECT user_id, available, locked, updated_at FROM balances WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(Balance {
            user_id,
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
            updated_at: Utc::now(),
        });
        Ok(balance)
    }

    async fn get_position(&self, user_id: Uuid, market_id: Uuid, outcome: Outcome) -> Result<Position, EscrowError> {
        let position = sqlx::query_as::<_, Position>(
            "SELECT user_id, market_id, outcome, quantity, avg_cost, updated_at FROM positions WHERE user_id = $1 AND market_id = $2 AND outcome = $3",
        )
        .bind(user_id)
        .bind(market_id)
        .bind(outcome)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(Position {
            user_id,
            market_id,
            outcome,
            quantity: Decimal::ZERO,
            avg_cost: Decimal::ZERO,
            updated_at: Utc::now(),
        });
        Ok(position)
    }

    async fn recent_trades(&self, market_id: Uuid, limit: i64) -> Result<Vec<Trade>, EscrowError> {
        let trades = sqlx::query_as::<_, Trade>(
            r#"
            SELECT id, market_id, outcome, maker_order_id, taker_order_id, maker_user_id, taker_user_id, taker_side, price, quantity, sequence, executed_at
            FROM trades
            WHERE market_id = $1
            ORDER BY sequence DESC
            LIMIT $2
            "#,
        )
        .bind(market_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(trades)
    }
}

async fn release_open_orders(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, market_id: Uuid) -> Result<(), EscrowError> {
    let open_buys = sqlx::query_as::<_, Order>(
        "SELECT * FROM orders WHERE market_id = $1 AND side = 'buy' AND status NOT IN ('filled', 'cancelled') FOR UPDATE",
    )
    .bind(market_id)
    .fetch_all(&mut **tx)
    .await?;
    for order in open_buys {
        let released = order.remaining() * order.price.unwrap_or(Decimal::ZERO);
        sqlx::query("UPDATE balances SET available = available + $1, locked = locked - $1, updated_at = now() WHERE user_id = $2")
            .bind(released)
            .bind(order.user_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("UPDATE orders SET status = 'cancelled', updated_at = now() WHERE id = $1")
            .bind(order.id)
            .execute(&mut **tx)
            .await?;
    }

    sqlx::query(
        "UPDATE orders SET status = 'cancelled', updated_at = now() WHERE market_id = $1 AND side = 'sell' AND status NOT IN ('filled', 'cancelled')",
    )
    .bind(market_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
