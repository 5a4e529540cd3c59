//! In-memory [`Ledger`] used by the test suite (spec's "AMBIENT — Test
//! Tooling"): the same transactional contract as [`super::SqlxLedger`],
//! implemented over a `parking_lot::Mutex<State>` instead of Postgres so
//! the Engine's semantics can be verified without a live database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

use super::{
    CancellationCommit, EscrowError, Ledger, SettledPosition, SettlementCommit, SubmissionCommit, SubmissionInput,
};
use crate::models::balance::Balance;
use crate::models::market::Outcome;
use crate::models::order::{Order, OrderStatus, Side};
use crate::models::order_event::{OrderEvent, OrderEventKind};
use crate::models::position::Position;
use crate::models::trade::Trade;

#[derive(Default)]
struct State {
    balances: HashMap<Uuid, Balance>,
    positions: HashMap<(Uuid, Uuid, Outcome), Position>,
    orders: HashMap<Uuid, Order>,
    trades: Vec<Trade>,
    order_event_sequences: HashMap<Uuid, u64>,
}

impl State {
    fn next_order_event_sequence(&mut self, market_id: Uuid) -> u64 {
        let seq = self.order_event_sequences.entry(market_id).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Current total |shares| a user holds across both outcomes of a market.
    fn total_position_quantity(&self, user_id: Uuid, market_id: Uuid) -> Decimal {
        [Outcome::Yes, Outcome::No]
            .into_iter()
            .map(|outcome| {
                self.positions
                    .get(&(user_id, market_id, outcome))
                    .map(|p| p.quantity)
                    .unwrap_or(Decimal::ZERO)
            })
            .sum()
    }
}

impl State {
    fn balance_mut(&mut self, user_id: Uuid) -> &mut Balance {
        self.balances.entry(user_id).or_insert_with(|| Balance {
            user_id,
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
            updated_at: Utc::now(),
        })
    }

    fn position_mut(&mut self, user_id: Uuid, market_id: Uuid, outcome: Outcome) -> &mut Position {
        self.positions
            .entry((user_id, market_id, outcome))
            .or_insert_with(|| Position {
                user_id,
                market_id,
                outcome,
                quantity: Decimal::ZERO,
                avg_cost: Decimal::ZERO,
                updated_at: Utc::now(),
            })
    }

    /// Shares not already committed to another resting SELL order for the
    /// same (user, market, outcome): the existing position quantity is
    /// marked as reserved against concurrent sells.
    fn free_sell_quantity(&self, user_id: Uuid, market_id: Uuid, outcome: Outcome) -> Decimal {
        let owned = self
            .positions
            .get(&(user_id, market_id, outcome))
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);
        let reserved: Decimal = self
            .orders
            .values()
            .filter(|o| {
                o.user_id == user_id
                    && o.market_id == market_id
                    && o.outcome == outcome
                    && o.side == Side::Sell
                    && !o.status.is_terminal()
            })
            .map(|o| o.remaining())
            .sum();
        owned - reserved
    }
}

/// In-memory stand-in for the durable ledger. Each public method locks the
/// whole state for its duration, which is what makes it transactional: no
/// other call observes a partially-applied submission.
pub struct InMemoryLedger {
    state: Mutex<State>,
    trade_sequence: AtomicI64,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            trade_sequence: AtomicI64::new(1),
        }
    }

    /// Test helper: grant a user starting cash. Not part of the [`Ledger`]
    /// contract — deposits are an external collaborator.
    pub fn seed_balance(&self, user_id: Uuid, available: Decimal) {
        let mut state = self.state.lock();
        let balance = state.balance_mut(user_id);
        balance.available = available;
    }

    /// Test helper: grant a user a starting position, as if acquired
    /// off-book (e.g. via a prior trade not exercised by the test).
    pub fn seed_position(&self, user_id: Uuid, market_id: Uuid, outcome: Outcome, quantity: Decimal, avg_cost: Decimal) {
        let mut state = self.state.lock();
        let position = state.position_mut(user_id, market_id, outcome);
        position.quantity = quantity;
        position.avg_cost = avg_cost;
    }

    fn next_trade_sequence(&self) -> i64 {
        self.trade_sequence.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn submit_order(&self, input: SubmissionInput) -> Result<SubmissionCommit, EscrowError> {
        let mut state = self.state.lock();

        let reservation_price = input.limit_price.unwrap_or(input.reference_price);
        let reserved = input.quantity * reservation_price;

        match input.side {
            Side::Buy => {
                if let Some(cap) = input.position_cap {
                    let projected = state.total_position_quantity(input.user_id, input.market_id) + input.quantity;
                    if projected > cap {
                        return Err(EscrowError::PositionCapExceeded {
                            cap,
                            attempted: projected,
                        });
                    }
                }
                let balance = state.balance_mut(input.user_id);
                if balance.available < reserved {
                    return Err(EscrowError::InsufficientBalance {
                        needed: reserved,
                        available: balance.available,
                    });
                }
                balance.available -= reserved;
                balance.locked += reserved;
            }
            Side::Sell => {
                let free = state.free_sell_quantity(input.user_id, input.market_id, input.outcome);
                if free < input.quantity {
                    return Err(EscrowError::InsufficientShares {
                        needed: input.quantity,
                        available: free,
                    });
                }
            }
        }

        let residual_rests = input.limit_price.is_some() && !input.residual_cancelled && input.incoming_remaining > Decimal::ZERO;
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

            // Buyer: pays cost, gains shares at the running VWAP.
            {
                let position = state.position_mut(buyer, input.market_id, input.outcome);
                let new_qty = position.quantity + qty;
                position.avg_cost = if new_qty.is_zero() {
                    Decimal::ZERO
                } else {
                    (position.quantity * position.avg_cost + fill_cost) / new_qty
                };
                position.quantity = new_qty;
                position.updated_at = Utc::now();
            }
            if input.side == Side::Buy {
                let balance = state.balance_mut(buyer);
                balance.locked -= fill_cost;
            }

            // Seller: gives up shares (avg_cost frozen), is credited cash.
            {
                let position = state.position_mut(seller, input.market_id, input.outcome);
                position.quantity -= qty;
                position.updated_at = Utc::now();
            }
            {
                let balance = state.balance_mut(seller);
                balance.available += fill_cost;
            }

            // Maker bookkeeping.
            let maker_status = if fill.maker_fully_filled {
                OrderStatus::Filled
            } else {
                OrderStatus::Partial
            };
            if let Some(maker) = state.orders.get_mut(&fill.maker_order_id) {
                maker.filled_quantity += qty;
                maker.status = maker_status;
                maker.updated_at = Utc::now();
            }

            let trade = Trade {
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
                sequence: self.next_trade_sequence(),
                executed_at: Utc::now(),
            };

            let taker_sequence = state.next_order_event_sequence(input.market_id);
            order_events.push(OrderEvent {
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
                sequence: taker_sequence,
                occurred_at: Utc::now(),
            });
            let maker_sequence = state.next_order_event_sequence(input.market_id);
            order_events.push(OrderEvent {
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
                sequence: maker_sequence,
                occurred_at: Utc::now(),
            });

            state.trades.push(trade.clone());
            trades.push(trade);
        }

        if input.side == Side::Buy {
            let residual_lock_target = if residual_rests {
                input.incoming_remaining * input.limit_price.expect("checked above")
            } else {
                Decimal::ZERO
            };
            let balance = state.balance_mut(input.user_id);
            let refund = reserved - consumed_cost - residual_lock_target;
            balance.locked -= refund;
            balance.available += refund;
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
        state.orders.insert(order.id, order.clone());

        let taker_balance = state.balance_mut(input.user_id).clone();
        let taker_position = state
            .positions
            .get(&(input.user_id, input.market_id, input.outcome))
            .cloned();

        Ok(SubmissionCommit {
            order,
            trades,
            taker_balance,
            taker_position,
            order_events,
        })
    }

    async fn cancel_order(&self, order_id: Uuid, user_id: Uuid) -> Result<CancellationCommit, EscrowError> {
        let mut state = self.state.lock();
        let order = state.orders.get(&order_id).ok_or(EscrowError::NotFound)?;
        if order.user_id != user_id {
            return Err(EscrowError::NotOwner);
        }
        if order.status.is_terminal() {
            return Err(EscrowError::AlreadyTerminal);
        }

        let (market_id, outcome, side, price, remaining) =
            (order.market_id, order.outcome, order.side, order.price, order.remaining());

        let balance = if side == Side::Buy {
            let price = price.expect("BUY orders always carry a limit or reservation price");
            let released = remaining * price;
            let balance = state.balance_mut(user_id);
            balance.locked -= released;
            balance.available += released;
            Some(balance.clone())
        } else {
            None
        };

        if let Some(order) = state.orders.get_mut(&order_id) {
            order.status = OrderStatus::Cancelled;
            order.updated_at = Utc::now();
        }

        let sequence = state.next_order_event_sequence(market_id);
        let order_event = OrderEvent {
            market_id,
            order_id,
            user_id,
            outcome,
            status: OrderStatus::Cancelled,
            kind: OrderEventKind::Cancel,
            sequence,
            occurred_at: Utc::now(),
        };

        Ok(CancellationCommit {
            balance,
            side,
            price,
            order_event,
        })
    }

    async fn resolve_market(&self, market_id: Uuid, outcome: Outcome) -> Result<SettlementCommit, EscrowError> {
        let mut state = self.state.lock();
        release_open_orders(&mut state, market_id);

        let keys: Vec<(Uuid, Uuid, Outcome)> = state
            .positions
            .keys()
            .filter(|(_, m, _)| *m == market_id)
            .cloned()
            .collect();

        let mut settled = Vec::new();
        let mut total_payout = Decimal::ZERO;

        for key @ (user_id, _, position_outcome) in keys {
            let quantity = state.positions.get(&key).map(|p| p.quantity).unwrap_or(Decimal::ZERO);
            if quantity <= Decimal::ZERO {
                continue;
            }
            let won = position_outcome == outcome;
            let payout = if won { quantity } else { Decimal::ZERO };
            if payout > Decimal::ZERO {
                state.balance_mut(user_id).available += payout;
                total_payout += payout;
            }
            if let Some(position) = state.positions.get_mut(&key) {
                position.quantity = Decimal::ZERO;
                position.updated_at = Utc::now();
            }
            settled.push(SettledPosition {
                user_id,
                outcome: position_outcome,
                payout,
                won,
            });
        }

        Ok(SettlementCommit { settled, total_payout })
    }

    async fn cancel_market(&self, market_id: Uuid) -> Result<SettlementCommit, EscrowError> {
        let mut state = self.state.lock();
        release_open_orders(&mut state, market_id);

        let keys: Vec<(Uuid, Uuid, Outcome)> = state
            .positions
            .keys()
            .filter(|(_, m, _)| *m == market_id)
            .cloned()
            .collect();

        let mut settled = Vec::new();
        let mut total_payout = Decimal::ZERO;

        for key @ (user_id, _, outcome) in keys {
            let (quantity, avg_cost) = state
                .positions
                .get(&key)
                .map(|p| (p.quantity, p.avg_cost))
                .unwrap_or((Decimal::ZERO, Decimal::ZERO));
            if quantity <= Decimal::ZERO {
                continue;
            }
            let refund = quantity * avg_cost;
            state.balance_mut(user_id).available += refund;
            total_payout += refund;
            if let Some(position) = state.positions.get_mut(&key) {
                position.quantity = Decimal::ZERO;
                position.updated_at = Utc::now();
            }
            settled.push(SettledPosition {
                user_id,
                outcome,
                payout: refund,
                won: false,
            });
        }

        Ok(SettlementCommit { settled, total_payout })
    }

    async fn get_balance(&self, user_id: Uuid) -> Result<Balance, EscrowError> {
        Ok(self.state.lock().balance_mut(user_id).clone())
    }

    async fn get_position(&self, user_id: Uuid, market_id: Uuid, outcome: Outcome) -> Result<Position, EscrowError> {
        Ok(self.state.lock().position_mut(user_id, market_id, outcome).clone())
    }

    async fn recent_trades(&self, market_id: Uuid, limit: i64) -> Result<Vec<Trade>, EscrowError> {
        let state = self.state.lock();
        let mut trades: Vec<Trade> = state.trades.iter().filter(|t| t.market_id == market_id).cloned().collect();
        trades.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        trades.truncate(limit.max(0) as usize);
        Ok(trades)
    }
}

/// Banker's rounding at fill-cost computation: any half-cent the tick grid
/// forces rounds to even rather than consistently up or down.
pub(super) fn round_fill_cost(cost: Decimal) -> Decimal {
    cost.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven)
}

fn release_open_orders(state: &mut State, market_id: Uuid) {
    let open_buy_orders: Vec<(Uuid, Uuid, Decimal)> = state
        .orders
        .values()
        .filter(|o| o.market_id == market_id && !o.status.is_terminal() && o.side == Side::Buy)
        .map(|o| (o.id, o.user_id, o.remaining() * o.price.unwrap_or(Decimal::ZERO)))
        .collect();

    for (order_id, user_id, released) in open_buy_orders {
        let balance = state.balance_mut(user_id);
        balance.locked -= released;
        balance.available += released;
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.status = OrderStatus::Cancelled;
            order.updated_at = Utc::now();
        }
    }

    let open_sell_ids: Vec<Uuid> = state
        .orders
        .values()
        .filter(|o| o.market_id == market_id && !o.status.is_terminal() && o.side == Side::Sell)
        .map(|o| o.id)
        .collect();
    for order_id in open_sell_ids {
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.status = OrderStatus::Cancelled;
            order.updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn scenario_a_balances_and_positions() {
        let ledger = InMemoryLedger::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let market = Uuid::new_v4();
        ledger.seed_balance(bob, dec!(100));

        let maker_order_id = Uuid::new_v4();
        ledger
            .state
            .lock()
            .orders
            .insert(
                maker_order_id,
                Order {
                    id: maker_order_id,
                    user_id: alice,
                    market_id: market,
                    outcome: Outcome::Yes,
                    side: Side::Sell,
                    order_type: crate::models::order::OrderType::Limit,
                    time_in_force: crate::models::order::TimeInForce::Gtc,
                    price: Some(dec!(0.60)),
                    quantity: dec!(10),
                    filled_quantity: Decimal::ZERO,
                    status: OrderStatus::Open,
                    idempotency_key: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
            );

        let fill = crate::engine::Fill {
            maker_order_id,
            maker_user_id: alice,
            maker_price: dec!(0.60),
            taker_order_id: Uuid::new_v4(),
            taker_user_id: bob,
            quantity: dec!(4),
            maker_fully_filled: false,
        };

        let input = SubmissionInput {
            order_id: Uuid::new_v4(),
            user_id: bob,
            market_id: market,
            outcome: Outcome::Yes,
            side: Side::Buy,
            order_type: crate::models::order::OrderType::Limit,
            time_in_force: crate::models::order::TimeInForce::Gtc,
            idempotency_key: Some("k1".into()),
            limit_price: Some(dec!(0.65)),
            reference_price: dec!(0.65),
            quantity: dec!(4),
            created_at: Utc::now(),
            fills: vec![fill],
            incoming_filled: dec!(4),
            incoming_remaining: Decimal::ZERO,
            residual_cancelled: false,
            position_cap: None,
        };

        let commit = ledger.submit_order(input).await.unwrap();
        assert_eq!(commit.order.status, OrderStatus::Filled);
        assert_eq!(commit.taker_balance.locked, Decimal::ZERO);
        assert_eq!(commit.taker_balance.available, dec!(97.60));

        let alice_balance = ledger.get_balance(alice).await.unwrap();
        assert_eq!(alice_balance.available, dec!(2.40));

        let bob_position = ledger.get_position(bob, market, Outcome::Yes).await.unwrap();
        assert_eq!(bob_position.quantity, dec!(4));
        assert_eq!(bob_position.avg_cost, dec!(0.60));
    }
}
