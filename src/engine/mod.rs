//! C2 Engine: per-market, per-outcome matcher.
//!
//! A walk-and-fill loop over one book per `(market, outcome)` pair with a
//! monotonic trade sequence counter. `compute_fills` never mutates the
//! live [`Book`][crate::book::Book] itself — it only computes the
//! candidate fill set against an immutable snapshot of resting orders. The
//! caller ([`crate::market_actor`]) applies those fills to both the Book
//! and the durable ledger as a single atomic step, so a ledger failure
//! leaves the Book untouched.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::book::{Book, RestingOrder};
use crate::models::order::Side;

/// One matched fill produced by walking the book. Neither side's order has
/// been mutated yet — this is a pure computation result.
#[derive(Debug, Clone)]
pub struct Fill {
    pub maker_order_id: Uuid,
    pub maker_user_id: Uuid,
    pub maker_price: Decimal,
    pub taker_order_id: Uuid,
    pub taker_user_id: Uuid,
    pub quantity: Decimal,
    /// `true` once this fill exhausts the maker's remaining quantity.
    pub maker_fully_filled: bool,
}

/// The full result of a submission: every fill in execution order plus
/// whatever quantity the incoming order has left over.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub fills: Vec<Fill>,
    pub incoming_filled: Decimal,
    pub incoming_remaining: Decimal,
    /// Set when a MARKET order's walk was halted by the slippage collar
    /// or by running out of liquidity; the residual is never inserted in
    /// either case.
    pub halted_no_liquidity: bool,
}

pub struct IncomingOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub side: Side,
    /// `Some` for LIMIT; `None` for MARKET.
    pub limit_price: Option<Decimal>,
    pub quantity: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Walks `book` against `incoming` and returns the candidate fill set
/// without mutating the book. `reference_price` and `collar` bound how far
/// a MARKET order may walk; pass `collar: None` to disable the check for
/// LIMIT orders, which are bounded by their own limit price instead.
pub fn compute_fills(
    book: &Book,
    incoming: &IncomingOrder,
    reference_price: Option<Decimal>,
    collar: Option<Decimal>,
) -> MatchResult {
    let candidates = book.iter_matching(incoming.side, incoming.limit_price);

    let mut fills = Vec::new();
    let mut remaining = incoming.quantity;
    let mut halted_no_liquidity = false;

    for candidate in candidates {
        if remaining <= Decimal::ZERO {
            break;
        }
        if candidate.user_id == incoming.user_id {
            // Self-trade prevention: skip, maker stays resting.
            continue;
        }
        if incoming.limit_price.is_none() {
            if let (Some(reference), Some(collar_fraction)) = (reference_price, collar) {
                if exceeds_collar(candidate.price, reference, collar_fraction, incoming.side) {
                    halted_no_liquidity = true;
                    break;
                }
            }
        }

        let qty = remaining.min(candidate.remaining());
        let maker_fully_filled = qty >= candidate.remaining();
        fills.push(Fill {
            maker_order_id: candidate.id,
            maker_user_id: candidate.user_id,
            maker_price: candidate.price,
            taker_order_id: incoming.id,
            taker_user_id: incoming.user_id,
            quantity: qty,
            maker_fully_filled,
        });
        remaining -= qty;
    }

    if incoming.limit_price.is_none() && fills.is_empty() {
        halted_no_liquidity = true;
    }

    MatchResult {
        incoming_filled: incoming.quantity - remaining,
        incoming_remaining: remaining,
        halted_no_liquidity,
        fills,
    }
}

/// Applies an already-committed [`MatchResult`] to the live book: removes
/// fully-filled makers, reduces partials, and inserts the incoming order's
/// residual if it is a LIMIT order with quantity left over. Called only
/// after the corresponding ledger transaction has committed.
pub fn apply_to_book(book: &mut Book, incoming: &IncomingOrder, result: &MatchResult) {
    let maker_side = incoming.side.opposite();
    for fill in &result.fills {
        book.apply_fill(maker_side, fill.maker_price, fill.maker_order_id, fill.quantity);
    }

    if incoming.limit_price.is_some() && result.incoming_remaining > Decimal::ZERO && !result.halted_no_liquidity {
        book.insert(RestingOrder {
            id: incoming.id,
            user_id: incoming.user_id,
            side: incoming.side,
            price: incoming.limit_price.expect("checked above"),
            quantity: incoming.quantity,
            filled: result.incoming_filled,
            created_at: incoming.created_at,
        });
    }
}

fn exceeds_collar(candidate_price: Decimal, reference: Decimal, collar: Decimal, side: Side) -> bool {
    if reference.is_zero() {
        return false;
    }
    let deviation = ((candidate_price - reference) / reference).abs();
    match side {
        Side::Buy => candidate_price > reference && deviation > collar,
        Side::Sell => candidate_price < reference && deviation > collar,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn resting(user: Uuid, side: Side, price: Decimal, qty: Decimal, created_at: DateTime<Utc>) -> RestingOrder {
        RestingOrder {
            id: Uuid::new_v4(),
            user_id: user,
            side,
            price,
            quantity: qty,
            filled: Decimal::ZERO,
            created_at,
        }
    }

    #[test]
    fn scenario_a_simple_cross() {
        let mut book = Book::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let alice_ask = resting(alice, Side::Sell, dec!(0.60), dec!(10), Utc::now());
        let alice_id = alice_ask.id;
        book.insert(alice_ask);

        let incoming = IncomingOrder {
            id: Uuid::new_v4(),
            user_id: bob,
            side: Side::Buy,
            limit_price: Some(dec!(0.65)),
            quantity: dec!(4),
            created_at: Utc::now(),
        };
        let result = compute_fills(&book, &incoming, None, None);
        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].maker_order_id, alice_id);
        assert_eq!(result.fills[0].quantity, dec!(4));
        assert_eq!(result.fills[0].maker_price, dec!(0.60));
        assert_eq!(result.incoming_filled, dec!(4));
        assert_eq!(result.incoming_remaining, Decimal::ZERO);
    }

    #[test]
    fn scenario_b_price_time_priority() {
        let mut book = Book::new();
        let alice = Uuid::new_v4();
        let carol = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::milliseconds(1);
        let alice_ask = resting(alice, Side::Sell, dec!(0.60), dec!(5), t1);
        let alice_id = alice_ask.id;
        book.insert(alice_ask);
        let carol_ask = resting(carol, Side::Sell, dec!(0.60), dec!(5), t2);
        let carol_id = carol_ask.id;
        book.insert(carol_ask);

        let incoming = IncomingOrder {
            id: Uuid::new_v4(),
            user_id: bob,
            side: Side::Buy,
            limit_price: Some(dec!(0.60)),
            quantity: dec!(7),
            created_at: Utc::now(),
        };
        let result = compute_fills(&book, &incoming, None, None);
        assert_eq!(result.fills.len(), 2);
        assert_eq!(result.fills[0].maker_order_id, alice_id);
        assert_eq!(result.fills[0].quantity, dec!(5));
        assert_eq!(result.fills[1].maker_order_id, carol_id);
        assert_eq!(result.fills[1].quantity, dec!(2));
    }

    #[test]
    fn scenario_c_self_trade_skipped() {
        let mut book = Book::new();
        let alice = Uuid::new_v4();
        book.insert(resting(alice, Side::Sell, dec!(0.60), dec!(5), Utc::now()));

        let incoming = IncomingOrder {
            id: Uuid::new_v4(),
            user_id: alice,
            side: Side::Buy,
            limit_price: Some(dec!(0.65)),
            quantity: dec!(3),
            created_at: Utc::now(),
        };
        let result = compute_fills(&book, &incoming, None, None);
        assert!(result.fills.is_empty());
        assert_eq!(result.incoming_remaining, dec!(3));
    }

    #[test]
    fn scenario_d_market_order_slippage_collar() {
        let mut book = Book::new();
        let maker = Uuid::new_v4();
        let bob = Uuid::new_v4();
        book.insert(resting(maker, Side::Sell, dec!(0.50), dec!(3), Utc::now()));
        book.insert(resting(maker, Side::Sell, dec!(0.58), dec!(3), Utc::now() + chrono::Duration::milliseconds(1)));

        let incoming = IncomingOrder {
            id: Uuid::new_v4(),
            user_id: bob,
            side: Side::Buy,
            limit_price: None,
            quantity: dec!(5),
            created_at: Utc::now(),
        };
        let result = compute_fills(&book, &incoming, Some(dec!(0.50)), Some(dec!(0.05)));
        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].quantity, dec!(3));
        assert_eq!(result.incoming_remaining, dec!(2));
        assert!(result.halted_no_liquidity);
    }

    #[test]
    fn market_order_with_no_liquidity_fails_immediately() {
        let book = Book::new();
        let incoming = IncomingOrder {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            side: Side::Buy,
            limit_price: None,
            quantity: dec!(5),
            created_at: Utc::now(),
        };
        let result = compute_fills(&book, &incoming, None, None);
        assert!(result.fills.is_empty());
        assert!(result.halted_no_liquidity);
    }
}
