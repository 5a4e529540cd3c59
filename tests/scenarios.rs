//! End-to-end scenario tests driving the full submission path —
//! `OrderGateway` validation, `MarketActor` matching, and `InMemoryLedger`
//! settlement together — the way a caller at the HTTP boundary would.
//! These reproduce the walk-throughs used to review the matching and
//! escrow design, one test per scenario.

use predex_core::config::PredexConfig;
use predex_core::escrow::InMemoryLedger;
use predex_core::eventbus::EventBus;
use predex_core::gateway::OrderGateway;
use predex_core::market_actor::MarketActor;
use predex_core::models::market::{MarketStatus, Outcome};
use predex_core::models::order::{OrderStatus, OrderType, PlaceOrderRequest, Side, TimeInForce};
use predex_core::settlement::InMemoryMarketRepository;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

fn harness() -> (Arc<MarketActor>, Arc<InMemoryLedger>, OrderGateway) {
    let config = PredexConfig::default();
    let ledger = Arc::new(InMemoryLedger::new());
    let events = Arc::new(EventBus::new());
    let market_id = Uuid::new_v4();
    let markets = Arc::new(InMemoryMarketRepository::new());
    markets.seed(market_id, MarketStatus::Open);
    let actor = Arc::new(MarketActor::new(market_id, config.clone(), ledger.clone(), events, markets));
    let gateway = OrderGateway::new(config);
    (actor, ledger, gateway)
}

fn limit_request(outcome: Outcome, side: Side, price: Decimal, quantity: Decimal, key: &str) -> PlaceOrderRequest {
    PlaceOrderRequest {
        market_id: Uuid::nil(),
        outcome,
        side,
        order_type: OrderType::Limit,
        time_in_force: TimeInForce::Gtc,
        price: Some(price),
        quantity,
        idempotency_key: key.to_string(),
    }
}

#[tokio::test]
async fn scenario_a_simple_cross() {
    let (actor, ledger, gateway) = harness();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    ledger.seed_balance(bob, dec!(100));

    let ask = limit_request(Outcome::Yes, Side::Sell, dec!(0.60), dec!(10), "alice-1");
    gateway.validate(&ask).unwrap();
    actor.place_order(alice, ask).await.unwrap();

    let bid = limit_request(Outcome::Yes, Side::Buy, dec!(0.65), dec!(4), "bob-1");
    gateway.validate(&bid).unwrap();
    let outcome = actor.place_order(bob, bid).await.unwrap();

    assert_eq!(outcome.trades.len(), 1);
    assert_eq!(outcome.trades[0].price, dec!(0.60));
    assert_eq!(outcome.trades[0].quantity, dec!(4));
    assert_eq!(outcome.order.status, OrderStatus::Filled);

    // Bob reserved 4 x 0.65 = 2.60 up front, paid 4 x 0.60 = 2.40: 0.20 refunded.
    assert_eq!(outcome.balance.locked, Decimal::ZERO);
    assert_eq!(outcome.balance.available, dec!(97.60));
    assert_eq!(outcome.position.as_ref().unwrap().quantity, dec!(4));
    assert_eq!(outcome.position.as_ref().unwrap().avg_cost, dec!(0.60));

    let alice_balance = ledger.get_balance(alice).await.unwrap();
    assert_eq!(alice_balance.available, dec!(2.40));

    let snapshot = actor.snapshot(Outcome::Yes).await;
    assert_eq!(snapshot.asks.len(), 1);
    assert_eq!(snapshot.asks[0].quantity, dec!(6));
    assert!(snapshot.bids.is_empty());
}

#[tokio::test]
async fn scenario_b_price_time_priority() {
    let (actor, _ledger, gateway) = harness();
    let alice = Uuid::new_v4();
    let carol = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let alice_ask = limit_request(Outcome::Yes, Side::Sell, dec!(0.60), dec!(5), "alice-1");
    gateway.validate(&alice_ask).unwrap();
    actor.place_order(alice, alice_ask).await.unwrap();

    let carol_ask = limit_request(Outcome::Yes, Side::Sell, dec!(0.60), dec!(5), "carol-1");
    gateway.validate(&carol_ask).unwrap();
    actor.place_order(carol, carol_ask).await.unwrap();

    let bob_bid = limit_request(Outcome::Yes, Side::Buy, dec!(0.60), dec!(7), "bob-1");
    gateway.validate(&bob_bid).unwrap();
    let outcome = actor.place_order(bob, bob_bid).await.unwrap();

    assert_eq!(outcome.trades.len(), 2);
    assert_eq!(outcome.trades[0].maker_user_id, alice);
    assert_eq!(outcome.trades[0].quantity, dec!(5));
    assert_eq!(outcome.trades[1].maker_user_id, carol);
    assert_eq!(outcome.trades[1].quantity, dec!(2));
    assert_eq!(outcome.order.status, OrderStatus::Filled);
}

#[tokio::test]
async fn scenario_c_self_trade_skipped() {
    let (actor, _ledger, gateway) = harness();
    let alice = Uuid::new_v4();

    let ask = limit_request(Outcome::Yes, Side::Sell, dec!(0.60), dec!(5), "alice-1");
    gateway.validate(&ask).unwrap();
    actor.place_order(alice, ask).await.unwrap();

    let bid = limit_request(Outcome::Yes, Side::Buy, dec!(0.65), dec!(3), "alice-2");
    gateway.validate(&bid).unwrap();
    let outcome = actor.place_order(alice, bid).await.unwrap();

    assert!(outcome.trades.is_empty());
    assert_eq!(outcome.order.status, OrderStatus::Open);

    let snapshot = actor.snapshot(Outcome::Yes).await;
    assert_eq!(snapshot.asks.len(), 1);
    assert_eq!(snapshot.bids.len(), 1);
}

#[tokio::test]
async fn scenario_d_market_order_slippage_collar() {
    let mut config = PredexConfig::default();
    config.market_slippage_collar = dec!(0.05);
    let ledger = Arc::new(InMemoryLedger::new());
    let events = Arc::new(EventBus::new());
    let market_id = Uuid::new_v4();
    let markets = Arc::new(InMemoryMarketRepository::new());
    markets.seed(market_id, MarketStatus::Open);
    let actor = Arc::new(MarketActor::new(market_id, config.clone(), ledger.clone(), events, markets));
    let gateway = OrderGateway::new(config);

    let maker = Uuid::new_v4();
    let bob = Uuid::new_v4();
    ledger.seed_balance(bob, dec!(100));

    let near = limit_request(Outcome::Yes, Side::Sell, dec!(0.50), dec!(3), "maker-1");
    gateway.validate(&near).unwrap();
    actor.place_order(maker, near).await.unwrap();

    let far = limit_request(Outcome::Yes, Side::Sell, dec!(0.58), dec!(3), "maker-2");
    gateway.validate(&far).unwrap();
    actor.place_order(maker, far).await.unwrap();

    let market_buy = PlaceOrderRequest {
        market_id: Uuid::nil(),
        outcome: Outcome::Yes,
        side: Side::Buy,
        order_type: OrderType::Market,
        time_in_force: TimeInForce::Ioc,
        price: None,
        quantity: dec!(5),
        idempotency_key: "bob-1".to_string(),
    };
    gateway.validate(&market_buy).unwrap();
    let outcome = actor.place_order(bob, market_buy).await.unwrap();

    assert_eq!(outcome.trades.len(), 1);
    assert_eq!(outcome.trades[0].quantity, dec!(3));
    assert_eq!(outcome.trades[0].price, dec!(0.50));
    assert_eq!(outcome.order.status, OrderStatus::Cancelled);
    assert_eq!(outcome.order.filled_quantity, dec!(3));

    // Reserved cash for the unfilled 2 shares must come back.
    let bob_balance = ledger.get_balance(bob).await.unwrap();
    assert_eq!(bob_balance.locked, Decimal::ZERO);
}

#[tokio::test]
async fn scenario_f_idempotent_replay_returns_cached_result() {
    let (actor, ledger, gateway) = harness();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    ledger.seed_balance(bob, dec!(100));

    let ask = limit_request(Outcome::Yes, Side::Sell, dec!(0.60), dec!(10), "alice-1");
    actor.place_order(alice, ask).await.unwrap();

    let bid = limit_request(Outcome::Yes, Side::Buy, dec!(0.65), dec!(4), "bob-replay");
    gateway.validate(&bid).unwrap();

    assert!(gateway.check_idempotency(bob, &bid).is_none());
    let first = actor.place_order(bob, bid.clone()).await.unwrap();
    gateway.record_result(bob, &bid, Ok(first.clone()));

    // A resubmission with the same key and body must short-circuit the
    // gateway and never touch the actor again.
    let cached = gateway.check_idempotency(bob, &bid).expect("cached result");
    let cached = cached.expect("prior submission succeeded");
    assert_eq!(cached.order.id, first.order.id);
    assert_eq!(cached.trades.len(), first.trades.len());

    let snapshot = actor.snapshot(Outcome::Yes).await;
    assert_eq!(snapshot.asks[0].quantity, dec!(6));
}
