//! C1 Book: in-memory price-time priority order book for one
//! `(marketId, outcome)` pair.
//!
//! A `BTreeMap<PriceLevel, VecDeque<RestingOrder>>` per side, `PriceLevel`
//! a scaled-integer newtype for total ordering. A Book never touches
//! persistent storage; durability is EscrowLedger's job.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::Side;

/// Fixed-point price key so `BTreeMap` gives us total, deterministic
/// ordering without relying on `Decimal`'s own (non-`Ord`-friendly at scale)
/// comparisons. Scale is 1e8 even though prices here live in `(0, 1)`
/// rather than a perpetual's quote currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriceLevel(i64);

const PRICE_SCALE: i64 = 100_000_000;

impl PriceLevel {
    pub fn from_decimal(price: Decimal) -> Self {
        use rust_decimal::prelude::ToPrimitive;
        let scaled = (price * Decimal::from(PRICE_SCALE)).round();
        Self(scaled.to_i64().unwrap_or(0))
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(PRICE_SCALE)
    }
}

/// A resting order's view inside the Book. Intentionally a lean subset of
/// [`crate::models::order::Order`] — the Book only needs what matching and
/// snapshotting require; the durable copy of the full `Order` lives with
/// EscrowLedger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestingOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled: Decimal,
    pub created_at: DateTime<Utc>,
}

impl RestingOrder {
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
    pub order_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    /// Highest price first.
    pub bids: Vec<OrderbookLevel>,
    /// Lowest price first.
    pub asks: Vec<OrderbookLevel>,
}

/// One side's resting orders, price-ordered. Within a price level, orders
/// sit in a `VecDeque` in arrival order, which gives time priority for free
/// since the per-market actor processes submissions strictly serially —
/// the tertiary `orderId` tie-break only matters for orders that land in
/// the same millisecond, which `push_back` already orders by call sequence.
type SideLevels = BTreeMap<PriceLevel, VecDeque<RestingOrder>>;

/// The price-time priority book for a single `(market, outcome)` pair.
#[derive(Debug, Default)]
pub struct Book {
    bids: SideLevels,
    asks: SideLevels,
}

impl Book {
    pub fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }

    fn side_map_mut(&mut self, side: Side) -> &mut SideLevels {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    pub fn insert(&mut self, order: RestingOrder) {
        let level = PriceLevel::from_decimal(order.price);
        self.side_map_mut(order.side)
            .entry(level)
            .or_default()
            .push_back(order);
    }

    pub fn remove(&mut self, side: Side, price: Decimal, order_id: Uuid) -> Option<RestingOrder> {
        let level = PriceLevel::from_decimal(price);
        let map = self.side_map_mut(side);
        let queue = map.get_mut(&level)?;
        let pos = queue.iter().position(|o| o.id == order_id)?;
        let removed = queue.remove(pos);
        if queue.is_empty() {
            map.remove(&level);
        }
        removed
    }

    /// Reduces the resting order's filled amount; removes it from the book
    /// once fully filled. Returns `true` if the order was removed.
    pub fn apply_fill(&mut self, side: Side, price: Decimal, order_id: Uuid, qty: Decimal) -> bool {
        let level = PriceLevel::from_decimal(price);
        let map = self.side_map_mut(side);
        let Some(queue) = map.get_mut(&level) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|o| o.id == order_id) else {
            return false;
        };
        queue[pos].filled += qty;
        let fully_filled = queue[pos].remaining() <= Decimal::ZERO;
        if fully_filled {
            queue.remove(pos);
            if queue.is_empty() {
                map.remove(&level);
            }
        }
        fully_filled
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().map(|p| p.to_decimal())
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().map(|p| p.to_decimal())
    }

    /// Yields resting orders on the side opposite `incoming_side`, in
    /// priority order, that satisfy the marketability predicate. Does not
    /// mutate the book — consumption is the Engine's decision.
    pub fn iter_matching(&self, incoming_side: Side, limit_price: Option<Decimal>) -> Vec<RestingOrder> {
        match incoming_side {
            Side::Buy => self
                .asks
                .iter()
                .take_while(|(level, _)| match limit_price {
                    Some(limit) => level.to_decimal() <= limit,
                    None => true,
                })
                .flat_map(|(_, queue)| queue.iter().cloned())
                .collect(),
            Side::Sell => self
                .bids
                .iter()
                .rev()
                .take_while(|(level, _)| match limit_price {
                    Some(limit) => level.to_decimal() >= limit,
                    None => true,
                })
                .flat_map(|(_, queue)| queue.iter().cloned())
                .collect(),
        }
    }

    pub fn snapshot(&self, depth: usize) -> OrderbookSnapshot {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(depth)
            .map(|(level, queue)| OrderbookLevel {
                price: level.to_decimal(),
                quantity: queue.iter().map(|o| o.remaining()).sum(),
                order_count: queue.len(),
            })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(depth)
            .map(|(level, queue)| OrderbookLevel {
                price: level.to_decimal(),
                quantity: queue.iter().map(|o| o.remaining()).sum(),
                order_count: queue.len(),
            })
            .collect();
        OrderbookSnapshot { bids, asks }
    }

    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(id: Uuid, user: Uuid, side: Side, price: Decimal, qty: Decimal) -> RestingOrder {
        RestingOrder {
            id,
            user_id: user,
            side,
            price,
            quantity: qty,
            filled: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_best_prices() {
        let mut book = Book::new();
        book.insert(order(Uuid::new_v4(), Uuid::new_v4(), Side::Buy, dec!(0.60), dec!(5)));
        book.insert(order(Uuid::new_v4(), Uuid::new_v4(), Side::Sell, dec!(0.65), dec!(5)));
        assert_eq!(book.best_bid(), Some(dec!(0.60)));
        assert_eq!(book.best_ask(), Some(dec!(0.65)));
        assert!(!book.is_crossed());
    }

    #[test]
    fn test_price_time_priority_ordering() {
        let mut book = Book::new();
        let alice = Uuid::new_v4();
        let carol = Uuid::new_v4();
        let alice_order = order(Uuid::new_v4(), alice, Side::Sell, dec!(0.60), dec!(5));
        let alice_id = alice_order.id;
        book.insert(alice_order);
        let carol_order = order(Uuid::new_v4(), carol, Side::Sell, dec!(0.60), dec!(5));
        let carol_id = carol_order.id;
        book.insert(carol_order);

        let matches = book.iter_matching(Side::Buy, Some(dec!(0.60)));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, alice_id);
        assert_eq!(matches[1].id, carol_id);
    }

    #[test]
    fn test_remove_and_apply_fill() {
        let mut book = Book::new();
        let o = order(Uuid::new_v4(), Uuid::new_v4(), Side::Buy, dec!(0.60), dec!(5));
        let id = o.id;
        book.insert(o);
        assert!(!book.apply_fill(Side::Buy, dec!(0.60), id, dec!(2)));
        assert_eq!(book.best_bid(), Some(dec!(0.60)));
        assert!(book.apply_fill(Side::Buy, dec!(0.60), id, dec!(3)));
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn test_snapshot_aggregates_levels() {
        let mut book = Book::new();
        book.insert(order(Uuid::new_v4(), Uuid::new_v4(), Side::Buy, dec!(0.60), dec!(5)));
        book.insert(order(Uuid::new_v4(), Uuid::new_v4(), Side::Buy, dec!(0.60), dec!(3)));
        let snap = book.snapshot(10);
        assert_eq!(snap.bids.len(), 1);
        assert_eq!(snap.bids[0].quantity, dec!(8));
        assert_eq!(snap.bids[0].order_count, 2);
    }
}
