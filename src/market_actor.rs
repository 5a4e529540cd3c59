//! Per-market actor: owns a Book pair (YES & NO), Engine state, and a
//! reference to the ledger and event bus for exactly one market.
//!
//! The whole submit path — compute fills, commit to the ledger, mutate the
//! book, publish events — runs while the actor holds its own `Mutex`,
//! giving a per-market exclusive critical section without a separate
//! work-channel consumer task per market.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::book::{Book, OrderbookSnapshot};
use crate::clock::{Clock, SystemClock};
use crate::config::PredexConfig;
use crate::engine;
use crate::errors::{AppError, ErrorCode};
use crate::escrow::{EscrowError, Ledger, SubmissionInput};
use crate::eventbus::EventBus;
use crate::models::market::Outcome;
use crate::models::order::{Order, PlaceOrderRequest, Side};
use crate::settlement::MarketRepository;

impl From<EscrowError> for AppError {
    fn from(err: EscrowError) -> Self {
        match err {
            EscrowError::MarketNotOpen => AppError::new(ErrorCode::MarketNotOpen, "market is not open"),
            EscrowError::InsufficientBalance { needed, available } => AppError::new(
                ErrorCode::InsufficientBalance,
                format!("need {needed} available, have {available}"),
            ),
            EscrowError::InsufficientShares { needed, available } => AppError::new(
                ErrorCode::InsufficientShares,
                format!("need {needed} free shares, have {available}"),
            ),
            EscrowError::PositionCapExceeded { cap, attempted } => AppError::new(
                ErrorCode::PositionCapExceeded,
                format!("position cap {cap} exceeded, attempted total {attempted}"),
            ),
            EscrowError::NotFound => AppError::new(ErrorCode::NotFound, "order not found"),
            EscrowError::NotOwner => AppError::new(ErrorCode::NotOwner, "caller does not own this order"),
            EscrowError::AlreadyTerminal => AppError::new(ErrorCode::AlreadyTerminal, "order already terminal"),
            EscrowError::Internal(msg) => AppError::new(ErrorCode::Internal, msg),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PlaceOrderOutcome {
    pub order: Order,
    pub trades: Vec<crate::models::trade::Trade>,
    pub balance: crate::models::balance::Balance,
    pub position: Option<crate::models::position::Position>,
}

struct Books {
    yes: Book,
    no: Book,
}

impl Books {
    fn book(&self, outcome: Outcome) -> &Book {
        match outcome {
            Outcome::Yes => &self.yes,
            Outcome::No => &self.no,
        }
    }

    fn book_mut(&mut self, outcome: Outcome) -> &mut Book {
        match outcome {
            Outcome::Yes => &mut self.yes,
            Outcome::No => &mut self.no,
        }
    }
}

/// Owns the YES/NO book pair for one market and serializes every
/// submission and cancellation against it. `tokio::sync::Mutex` is held
/// across the ledger's `await`, so the critical section spans both the
/// in-memory match and the durable commit.
pub struct MarketActor {
    pub market_id: Uuid,
    config: PredexConfig,
    books: Mutex<Books>,
    ledger: Arc<dyn Ledger>,
    events: Arc<EventBus>,
    markets: Arc<dyn MarketRepository>,
    clock: Arc<dyn Clock>,
}

impl MarketActor {
    pub fn new(
        market_id: Uuid,
        config: PredexConfig,
        ledger: Arc<dyn Ledger>,
        events: Arc<EventBus>,
        markets: Arc<dyn MarketRepository>,
    ) -> Self {
        Self::with_clock(market_id, config, ledger, events, markets, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        market_id: Uuid,
        config: PredexConfig,
        ledger: Arc<dyn Ledger>,
        events: Arc<EventBus>,
        markets: Arc<dyn MarketRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            market_id,
            config,
            books: Mutex::new(Books {
                yes: Book::new(),
                no: Book::new(),
            }),
            ledger,
            events,
            markets,
            clock,
        }
    }

    pub async fn place_order(
        &self,
        user_id: Uuid,
        request: PlaceOrderRequest,
    ) -> Result<PlaceOrderOutcome, AppError> {
        let status = self.markets.status(self.market_id).await?;
        if !status.accepts_orders() {
            return Err(EscrowError::MarketNotOpen.into());
        }

        let order_id = crate::ids::new_id();
        let created_at = self.now();
        let mut books = self.books.lock().await;
        let book = books.book(request.outcome);

        let reference_price = reference_price(book, request.side);
        let incoming = engine::IncomingOrder {
            id: order_id,
            user_id,
            side: request.side,
            limit_price: request.price,
            quantity: request.quantity,
            created_at,
        };
        let collar = if request.price.is_none() {
            Some(self.config.market_slippage_collar)
        } else {
            None
        };
        let result = engine::compute_fills(book, &incoming, Some(reference_price), collar);

        if request.price.is_none() && result.fills.is_empty() && result.halted_no_liquidity {
            return Err(AppError::new(
                ErrorCode::NoLiquidity,
                "no resting liquidity to match this market order against",
            ));
        }

        let input = SubmissionInput {
            order_id,
            user_id,
            market_id: self.market_id,
            outcome: request.outcome,
            side: request.side,
            order_type: request.order_type,
            time_in_force: request.time_in_force,
            idempotency_key: Some(request.idempotency_key.clone()),
            limit_price: request.price,
            reference_price,
            quantity: request.quantity,
            created_at,
            fills: result.fills.clone(),
            incoming_filled: result.incoming_filled,
            incoming_remaining: result.incoming_remaining,
            residual_cancelled: result.halted_no_liquidity,
            position_cap: self.config.per_market_position_cap,
        };

        let commit = self.ledger.submit_order(input).await?;

        // Ledger committed; now, and only now, mutate the live book.
        engine::apply_to_book(books.book_mut(request.outcome), &incoming, &result);

        let snapshot = books.book(request.outcome).snapshot(20);
        drop(books);

        self.publish_submission_events(&commit, request.outcome, &snapshot).await;

        Ok(PlaceOrderOutcome {
            order: commit.order,
            trades: commit.trades,
            balance: commit.taker_balance,
            position: commit.taker_position,
        })
    }

    pub async fn cancel_order(&self, user_id: Uuid, order_id: Uuid, outcome: Outcome) -> Result<(), AppError> {
        let mut books = self.books.lock().await;
        let commit = self.ledger.cancel_order(order_id, user_id).await?;
        if let Some(price) = commit.price {
            books.book_mut(outcome).remove(commit.side, price, order_id);
        }
        drop(books);

        self.events
            .publish(
                format!("market:{}", self.market_id),
                "order_cancelled",
                serde_json::json!({ "orderId": order_id, "marketId": self.market_id }),
            )
            .await;
        self.events
            .publish(
                format!("user:{user_id}"),
                "order_event",
                serde_json::to_value(&commit.order_event).unwrap_or(serde_json::Value::Null),
            )
            .await;
        Ok(())
    }

    pub async fn snapshot(&self, outcome: Outcome) -> OrderbookSnapshot {
        self.books.lock().await.book(outcome).snapshot(50)
    }

    /// Replaces one side's book wholesale. Only used by startup recovery,
    /// before the actor is registered for live traffic.
    pub async fn restore_book(&self, outcome: Outcome, book: Book) {
        *self.books.lock().await.book_mut(outcome) = book;
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.clock.now_millis()).unwrap_or_else(Utc::now)
    }

    async fn publish_submission_events(
        &self,
        commit: &crate::escrow::SubmissionCommit,
        outcome: Outcome,
        snapshot: &OrderbookSnapshot,
    ) {
        self.events
            .publish(
                format!("market:{}", self.market_id),
                "orderbook_update",
                serde_json::json!({ "marketId": self.market_id, "outcome": outcome, "snapshot": snapshot }),
            )
            .await;

        for trade in &commit.trades {
            self.events
                .publish(
                    format!("market:{}:trades", self.market_id),
                    "trade_executed",
                    serde_json::json!({ "trade": trade }),
                )
                .await;
        }

        for event in &commit.order_events {
            self.events
                .publish(
                    format!("user:{}", event.user_id),
                    "order_event",
                    serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
                )
                .await;
        }

        self.events
            .publish(
                format!("user:{}", commit.order.user_id),
                "order_placed",
                serde_json::json!({ "order": commit.order }),
            )
            .await;

        tracing::debug!(order_id = %commit.order.id, status = ?commit.order.status, "order submission recorded");
    }
}

/// Best-effort reference price for MARKET order escrow/collar purposes:
/// the opposite side's best price, falling back to the midpoint of the
/// tick grid if the book is empty on both sides.
fn reference_price(book: &Book, incoming_side: Side) -> Decimal {
    match incoming_side {
        Side::Buy => book.best_ask().or_else(|| book.best_bid()).unwrap_or(Decimal::new(5, 1)),
        Side::Sell => book.best_bid().or_else(|| book.best_ask()).unwrap_or(Decimal::new(5, 1)),
    }
}
